use crate::jmp;
use std::{
    mem, ptr,
    sync::atomic::{AtomicI32, Ordering},
};

/// A way of copying memory out of the crashed process.
///
/// Implementations are called from the server loop, which may be running on
/// a thread that was `clone`d from a signal handler, so they must be async
/// signal safe, and must not allocate.
pub trait ReadMemory {
    /// Copies up to `to.len()` bytes starting at address `from`.
    ///
    /// Returns the number of bytes copied, which is never 0 on success, or a
    /// negated errno if the memory could not be read.
    fn read(&self, to: &mut [u8], from: u64) -> isize;
}

/// Checks if `CAP_SYS_PTRACE` is in the bounding set, in which case
/// [`ProcessVmReader`] can be used
pub fn has_ptrace_capability() -> bool {
    const CAP_SYS_PTRACE: libc::c_ulong = 19;

    unsafe { libc::prctl(libc::PR_CAPBSET_READ, CAP_SYS_PTRACE) > 0 }
}

/// Reads memory with `process_vm_readv`.
///
/// This is the preferred strategy, but reading another process requires
/// `CAP_SYS_PTRACE`.
pub struct ProcessVmReader {
    pid: libc::pid_t,
}

impl ProcessVmReader {
    #[inline]
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }
}

impl ReadMemory for ProcessVmReader {
    fn read(&self, to: &mut [u8], from: u64) -> isize {
        let local = libc::iovec {
            iov_base: to.as_mut_ptr().cast(),
            iov_len: to.len(),
        };
        let remote = libc::iovec {
            iov_base: from as *mut libc::c_void,
            iov_len: to.len(),
        };

        // SAFETY: syscall, the kernel validates the remote range
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };

        match read {
            n if n > 0 => n,
            0 => -(libc::EFAULT as isize),
            _ => -(errno() as isize),
        }
    }
}

/// The jump point for [`FaultTrapReader`], there is only ever one server
/// running at a time
static mut FAULT_JMP: mem::MaybeUninit<jmp::JmpBuf> = mem::MaybeUninit::uninit();

/// The signals that a bad read can raise
const FAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// The thread that is copying under [`FAULT_JMP`], or 0
static COPYING_TID: AtomicI32 = AtomicI32::new(0);

unsafe extern "C" fn on_fault(sig: libc::c_int) {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
        if COPYING_TID.load(Ordering::Acquire) == tid {
            jmp::siglongjmp((&raw mut FAULT_JMP).cast(), 1)
        }

        // Any other thread faulting is a genuine crash, which must take the
        // default action once we return and the fault re-fires
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Reads memory by copying it directly, trapping any `SIGSEGV` or `SIGBUS`
/// raised by the copy and reporting the range as unreadable.
///
/// This only works when the server shares the address space it is reading,
/// or holds a copy of it, but requires no privileges at all.
///
/// Only faults raised by the copy itself are trapped, a fault on any other
/// thread resets the signal to its default action, killing the process.
pub struct FaultTrapReader {
    old: [libc::sigaction; 2],
}

impl FaultTrapReader {
    /// Installs the fault handlers, they are restored when the reader is
    /// dropped.
    ///
    /// # Safety
    ///
    /// The handlers are process wide, no other code in the process may rely
    /// on `SIGSEGV` or `SIGBUS` until the reader is dropped, and only one
    /// reader may exist at a time.
    pub unsafe fn install() -> Self {
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigfillset(&mut sa.sa_mask);
            sa.sa_sigaction = on_fault as usize;
            sa.sa_flags = libc::SA_NODEFER;

            let mut old: [libc::sigaction; 2] = mem::zeroed();
            for (sig, old) in FAULT_SIGNALS.into_iter().zip(old.iter_mut()) {
                libc::sigaction(sig, &sa, old);
            }

            Self { old }
        }
    }
}

impl ReadMemory for FaultTrapReader {
    #[inline(never)]
    fn read(&self, to: &mut [u8], from: u64) -> isize {
        if to.is_empty() {
            return -(libc::EFAULT as isize);
        }

        // SAFETY: if the copy faults, `on_fault` jumps back here with a non-zero
        // value, nothing that lives across the jump is modified after the
        // jump point is set
        let read = unsafe {
            COPYING_TID.store(libc::syscall(libc::SYS_gettid) as libc::pid_t, Ordering::Release);

            if jmp::sigsetjmp((&raw mut FAULT_JMP).cast(), 1) == 0 {
                ptr::copy_nonoverlapping(from as *const u8, to.as_mut_ptr(), to.len());
                to.len() as isize
            } else {
                crate::debug_print!("trapped fault while copying");
                -(libc::EFAULT as isize)
            }
        };

        COPYING_TID.store(0, Ordering::Release);
        read
    }
}

impl Drop for FaultTrapReader {
    fn drop(&mut self) {
        for (sig, old) in FAULT_SIGNALS.into_iter().zip(self.old.iter()) {
            unsafe {
                libc::sigaction(sig, old, ptr::null_mut());
            }
        }
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn process_vm_reads_self() {
        let src: Vec<u8> = (0..=255).collect();
        let mut dst = [0u8; 256];

        let reader = ProcessVmReader::new(std::process::id() as i32);
        let read = reader.read(&mut dst, src.as_ptr() as u64);

        assert_eq!(read, 256);
        assert_eq!(&src[..], &dst[..]);
    }

    #[test]
    fn process_vm_inaccessible() {
        // Kept mapped, the other tests could map something over a freed page
        let page = unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(ptr, libc::MAP_FAILED);
            ptr as u64
        };

        let mut dst = [0u8; 64];
        let reader = ProcessVmReader::new(std::process::id() as i32);
        assert_eq!(reader.read(&mut dst, page), -(libc::EFAULT as isize));

        unsafe { libc::munmap(page as *mut libc::c_void, 4096) };
    }
}
