use super::{COORDINATOR, Signal};
use crate::Error;
use std::{
    io, mem, ptr,
    sync::atomic::{AtomicU64, Ordering},
};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack we map if the thread has none.
///
/// On top of the minimum there is another 16k, as the first call to a
/// dynamically linked function from the handler goes through the dynamic
/// linker, which is hungry for stack.
const SIG_STACK_SIZE: usize = get_stack_size() + 16 * 1024;

/// The signals we attempt to handle
pub(crate) const FATAL_SIGNALS: [Signal; 7] = [
    Signal::Quit,
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// One bit per signal number that we installed our handler for
static INSTALLED: AtomicU64 = AtomicU64::new(0);

/// Create an alternative stack to run the signal handlers on, if the current
/// thread doesn't have one that is big enough. This is done since the signal
/// might have been caused by a stack overflow.
pub(crate) unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
            return Err(io::Error::last_os_error().into());
        }

        // std gives every thread it spawns an alternate stack, which is too
        // small for us
        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            log::debug!("thread already has an alternate stack of {} bytes", old_stack.ss_size);
            return Ok(());
        }

        // Map a guard page below the stack, so that overflowing the alternate
        // stack faults instead of trampling whatever is mapped below it
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let stack_ptr = (ptr as usize + guard_size) as *mut libc::c_void;
        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };

        if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0
            || libc::sigaltstack(&new_stack, ptr::null_mut()) != 0
        {
            let err = io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        log::debug!("installed an alternate stack of {SIG_STACK_SIZE} bytes");
        Ok(())
    }
}

/// Installs our handler for every fatal signal that has the default
/// disposition, leaving any other handler in place.
///
/// Installing again is a no-op for the signals we already own.
pub(crate) unsafe fn install_handlers() -> Result<(), Error> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();

        // Block everything but the fatal signals while handling one, so a
        // second fault on the same thread kills us instead of being deferred
        // until the handler returns
        libc::sigfillset(&mut sa.sa_mask);
        for sig in FATAL_SIGNALS {
            libc::sigdelset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO | libc::SA_NODEFER;

        for sig in FATAL_SIGNALS {
            let mut old: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig as i32, ptr::null(), &mut old) != 0 {
                return Err(io::Error::last_os_error().into());
            }

            if old.sa_sigaction != libc::SIG_DFL {
                if old.sa_sigaction != signal_handler as usize {
                    log::debug!("leaving the existing handler for {sig:?} in place");
                }
                continue;
            }

            if libc::sigaction(sig as i32, &sa, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error().into());
            }

            INSTALLED.fetch_or(1 << sig as i32, Ordering::Relaxed);
        }

        Ok(())
    }
}

/// Restores the default disposition of every signal we installed our handler
/// for, unless someone else has replaced it since
pub(crate) unsafe fn uninstall_handlers() {
    let installed = INSTALLED.swap(0, Ordering::Relaxed);

    for sig in FATAL_SIGNALS {
        if installed & (1 << sig as i32) == 0 {
            continue;
        }

        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig as i32, ptr::null(), &mut current) == 0
                && current.sa_sigaction == signal_handler as usize
            {
                set_default_handler(sig as i32);
            }
        }
    }
}

/// Resets every fatal signal to its default disposition, so that a crash
/// while we are handling a crash kills the process right away
pub(crate) unsafe fn reset_fatal_handlers() {
    for sig in FATAL_SIGNALS {
        unsafe { set_default_handler(sig as i32) };
    }
}

/// Restores the handler for the specified signal back to its default, which
/// _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
pub(crate) unsafe fn set_default_handler(sig: libc::c_int) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

/// This is the actual function installed for each fatal signal, invoked by
/// the kernel
unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handler with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        let mut cur_handler: libc::sigaction = mem::zeroed();
        if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
            && cur_handler.sa_sigaction == signal_handler as usize
            && cur_handler.sa_flags & libc::SA_SIGINFO == 0
        {
            libc::sigfillset(&mut cur_handler.sa_mask);
            for sig in FATAL_SIGNALS {
                libc::sigdelset(&mut cur_handler.sa_mask, sig as i32);
            }
            cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO | libc::SA_NODEFER;

            if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                // When resetting the handler fails, try to reset the
                // default one to avoid an infinite loop here.
                set_default_handler(sig);
            }

            crate::debug_print!("reinstalled handler that lost SA_SIGINFO");
            return;
        }

        COORDINATOR.handle_crash(sig, &*info, uc);
    }
}
