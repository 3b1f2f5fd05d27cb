use super::{
    backtracer::Launcher,
    futex::{Gate, Occupancy, PauseCounter, ThreadLock},
    state,
    threads::{ProcTaskDir, gettid, tgkill},
};
use crash_info::{CrashInfo, ThreadList, ThreadRecord};
use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU8, Ordering},
    time::Duration,
};

/// How long we wait for the other threads to check in before carrying on
/// without them
pub const SUSPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the crash sequence is at, later states compare greater
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CrashState {
    /// Nothing has crashed
    Idle,
    /// Every other thread has been paused
    Handling,
    /// The memory server is running. This only lasts until the backtracer is
    /// started, which follows immediately
    MemoryServerUp,
    /// The backtracer is running
    Backtracing,
    /// The paused threads are being released
    Resuming,
    /// The signal is about to kill us
    Terminated,
}

impl CrashState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Handling,
            2 => Self::MemoryServerUp,
            3 => Self::Backtracing,
            4 => Self::Resuming,
            5 => Self::Terminated,
            _ => Self::Idle,
        }
    }
}

/// All of the process wide state used while crashing.
///
/// Everything here is usable from a signal handler. The [`CrashInfo`] is only
/// written by the holder of the thread lock, and the launcher is only swapped
/// while holding it.
pub(crate) struct Coordinator {
    crash_info: UnsafeCell<CrashInfo>,
    pub(super) lock: ThreadLock,
    pub(super) paused: PauseCounter,
    /// Closed while threads are meant to stay paused
    pub(super) gate: Gate,
    pub(super) inside: Occupancy,
    /// The record of the thread holding the lock, the tail of the thread list
    pub(super) owner_record: AtomicPtr<ThreadRecord>,
    state: AtomicU8,
    launcher: AtomicPtr<Launcher>,
}

// SAFETY: see above
unsafe impl Sync for Coordinator {}

pub(crate) static COORDINATOR: Coordinator = Coordinator::new();

impl Coordinator {
    const fn new() -> Self {
        Self {
            crash_info: UnsafeCell::new(CrashInfo::new()),
            lock: ThreadLock::new(),
            paused: PauseCounter::new(),
            gate: Gate::new(),
            inside: Occupancy::new(),
            owner_record: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(CrashState::Idle as u8),
            launcher: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The registry of paused threads, which lives in the [`CrashInfo`]
    #[inline]
    pub(crate) fn thread_list(&self) -> &ThreadList {
        // SAFETY: the list is atomic and the other fields are never referenced
        unsafe { &*ptr::addr_of!((*self.crash_info.get()).thread_list) }
    }

    /// The address handed to the backtracer
    #[inline]
    pub(crate) fn crash_info_address(&self) -> u64 {
        self.crash_info.get() as u64
    }

    #[inline]
    pub(crate) fn state(&self) -> CrashState {
        CrashState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: CrashState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Replaces the launcher used by the next crash
    pub(crate) fn set_launcher(&self, launcher: Option<Box<Launcher>>) {
        let new = launcher.map_or(ptr::null_mut(), Box::into_raw);

        // A `Suspension` on this thread already holds the lock, so no crash can
        // be using the launcher but one on this thread, which can't interrupt
        // the swap halfway
        let tid = gettid();
        let held = self.lock.owner() == tid;
        if !held {
            self.lock.lock(tid);
        }
        let old = self.launcher.swap(new, Ordering::AcqRel);
        if !held {
            self.lock.unlock();
        }

        if !old.is_null() {
            // SAFETY: only ever set from `Box::into_raw`, and no crash can be
            // using it now that it is out of the pointer
            drop(unsafe { Box::from_raw(old) });
        }
    }

    /// The crash sequence, run by the signal handler for every fatal signal.
    ///
    /// # Safety
    ///
    /// Must only be called from the fatal signal handler, with the arguments
    /// the kernel gave it.
    pub(crate) unsafe fn handle_crash(
        &self,
        sig: libc::c_int,
        info: &libc::siginfo_t,
        uc: *mut libc::c_void,
    ) {
        let saved_errno = errno::errno();
        let tid = gettid();
        let mut me = ThreadRecord::new(tid.into(), uc as u64);

        // If we already hold the lock a `Suspension` on this thread has paused
        // everyone else, and its record for us is already in the list
        let suspended_already = self.lock.owner() == tid;
        if suspended_already {
            let record = self.owner_record.load(Ordering::Acquire);
            if !record.is_null() {
                // SAFETY: the record is kept alive by the `Suspension`, which
                // can't be dropped while we are running on its thread
                unsafe { ptr::addr_of_mut!((*record).context).write(uc as u64) };
            }
        } else {
            // SAFETY: `me` outlives the crash sequence
            unsafe {
                self.suspend_others(&mut ProcTaskDir, &mut me, SUSPEND_TIMEOUT);
            }
        }

        self.set_state(CrashState::Handling);

        // SAFETY: from here on we are the only writer of the crash info
        unsafe {
            state::reset_fatal_handlers();

            let ci = self.crash_info.get();
            ptr::addr_of_mut!((*ci).crashing_thread).write(tid as u64);
            ptr::addr_of_mut!((*ci).signal).write(sig as u64);
            ptr::addr_of_mut!((*ci).fault_address).write(info.si_addr() as u64);

            match self.launcher.load(Ordering::Acquire).as_ref() {
                Some(launcher) => self.run_backtracer(launcher),
                None => {
                    crate::debug_print!("no backtracer configured");
                }
            }
        }

        self.set_state(CrashState::Resuming);
        if !suspended_already {
            self.resume_others();
        }
        self.set_state(CrashState::Terminated);

        errno::set_errno(saved_errno);

        // Faults re-fire when we return, now that the default handler is
        // installed. Signals sent with kill(), and ones that don't re-fire,
        // eg. a trap that has already stepped past the breakpoint, need to be
        // sent again.
        if info.si_code <= 0 || matches!(sig, libc::SIGABRT | libc::SIGQUIT | libc::SIGTRAP) {
            // SAFETY: syscalls
            unsafe {
                if !tgkill(libc::getpid(), tid, sig) {
                    // If we failed to kill ourselves (e.g. because a sandbox
                    // disallows us to do so), we instead resort to
                    // terminating our process. This will result in an
                    // incorrect exit code.
                    libc::_exit(1);
                }
            }
        }
    }

    unsafe fn run_backtracer(&self, launcher: &Launcher) {
        let mode = launcher.memserver_mode();

        // SAFETY: we hold the thread lock, so this is the only server
        match unsafe { memserver::start(mode) } {
            Ok(server) => {
                self.set_state(CrashState::MemoryServerUp);
                self.set_state(CrashState::Backtracing);
                // SAFETY: we hold the thread lock
                if !unsafe { launcher.run(self.crash_info_address(), server.fd()) } {
                    crate::debug_print!("failed to run the backtracer");
                }

                drop(server);
            }
            Err(_) => {
                crate::debug_print!("failed to start the memory server");
            }
        }

        // A server on a thread traps faults with its own handlers
        if mode == memserver::Mode::Thread {
            // SAFETY: syscalls
            unsafe {
                state::set_default_handler(libc::SIGSEGV);
                state::set_default_handler(libc::SIGBUS);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn states_progress() {
        let states = [
            CrashState::Idle,
            CrashState::Handling,
            CrashState::MemoryServerUp,
            CrashState::Backtracing,
            CrashState::Resuming,
            CrashState::Terminated,
        ];

        for pair in states.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
        for state in states {
            assert_eq!(CrashState::from_u8(state as u8), state);
        }
        assert_eq!(CrashState::from_u8(200), CrashState::Idle);
    }
}
