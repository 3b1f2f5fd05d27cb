use super::{
    coordinator::{COORDINATOR, Coordinator, SUSPEND_TIMEOUT},
    threads::{ProcTaskDir, ThreadSource, gettid, tgkill},
};
use crash_info::ThreadRecord;
use std::{
    mem, ptr,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

/// Sent to every thread we want to pause
const PAUSE_SIGNAL: libc::c_int = libc::SIGPROF;

impl Coordinator {
    /// Takes the thread lock and pauses every other thread that `source`
    /// reports, with `me` as the first entry in the thread list.
    ///
    /// Rescans until two scans in a row see the same number of threads, so
    /// that threads created while we were scanning are caught too, or until
    /// `timeout` has elapsed.
    ///
    /// Returns the number of threads that were sent the pause signal.
    ///
    /// # Safety
    ///
    /// `me` must stay alive and in place until [`Self::resume_others`].
    pub(crate) unsafe fn suspend_others(
        &self,
        source: &mut dyn ThreadSource,
        me: &mut ThreadRecord,
        timeout: Duration,
    ) -> u32 {
        let tid = me.tid as libc::pid_t;
        self.lock.lock(tid);

        // SAFETY: guaranteed by the caller
        unsafe { self.thread_list().reset(me) };
        self.owner_record.store(ptr::from_mut(me), Ordering::Release);
        self.paused.reset();
        self.gate.close();

        // SAFETY: syscalls
        let old = unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigfillset(&mut sa.sa_mask);
            sa.sa_sigaction = pause_thread as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_RESTART;

            let mut old: libc::sigaction = mem::zeroed();
            libc::sigaction(PAUSE_SIGNAL, &sa, &mut old);
            old
        };

        // SAFETY: syscall
        let pid = unsafe { libc::getpid() };
        let deadline = Instant::now() + timeout;
        let list = self.thread_list();

        let mut signalled = 0;
        let mut prev_count = None;

        loop {
            let mut count = 0u32;

            let scanned = source.for_each_thread(&mut |thread| {
                if thread == tid {
                    return;
                }
                count += 1;

                // A thread that exited since the scan can't be signalled, and
                // must not be waited for either.
                // SAFETY: every record in the list belongs to a thread that is
                // waiting for the gate we closed
                if !unsafe { list.contains(thread.into()) } && tgkill(pid, thread, PAUSE_SIGNAL) {
                    signalled += 1;
                }
            });

            if scanned.is_err() {
                crate::debug_print!("failed to list threads");
            }

            self.paused
                .wait_for(signalled, deadline.saturating_duration_since(Instant::now()));

            if prev_count == Some(count) || Instant::now() >= deadline {
                break;
            }
            prev_count = Some(count);
        }

        // SAFETY: syscall
        unsafe { libc::sigaction(PAUSE_SIGNAL, &old, ptr::null_mut()) };

        signalled
    }

    /// Lets every paused thread go, the thread list is emptied as its records
    /// are about to go out of scope.
    ///
    /// The lock is only released once every thread has left the pause
    /// handler, a thread still inside it would otherwise miss the pause
    /// signal of the next suspension, which it has blocked.
    pub(crate) fn resume_others(&self) {
        self.thread_list().clear();
        self.gate.open();

        if !self.inside.wait_empty(SUSPEND_TIMEOUT) {
            crate::debug_print!("paused threads did not leave the pause handler");
        }

        // A thread that checked in late may have linked itself in again
        self.thread_list().clear();
        self.owner_record.store(ptr::null_mut(), Ordering::Release);
        self.lock.unlock();
    }
}

/// The handler for [`PAUSE_SIGNAL`], which checks in and then blocks until
/// the suspension is over
unsafe extern "C" fn pause_thread(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let saved_errno = errno::errno();
    let tid = gettid();

    // A stray SIGPROF, eg. from a profiler, on the thread that is doing the
    // pausing must not deadlock it
    if COORDINATOR.lock.owner() != tid {
        COORDINATOR.inside.enter();

        // A signal that arrives after the suspension gave up on us has nothing
        // to wait for
        if COORDINATOR.gate.is_closed() {
            let mut me = ThreadRecord::new(tid.into(), uc as u64);

            // SAFETY: the list is cleared before the lock is released, which
            // waits for us to leave
            unsafe { COORDINATOR.thread_list().push(&mut me) };
            COORDINATOR.paused.notify();

            COORDINATOR.gate.wait_open();
        }

        COORDINATOR.inside.leave();
    }

    errno::set_errno(saved_errno);
}

/// Every other thread in the process, paused.
///
/// The threads are resumed when this is dropped. While they are paused any
/// of them might be holding a lock, eg. the one in the allocator, so avoid
/// anything that might take one.
///
/// Suspensions don't nest, starting another one on the thread holding this
/// one deadlocks on the thread lock. Attaching or detaching a
/// [`crate::CrashHandler`] works, but allocates, see above.
pub struct Suspension {
    /// Our entry in the thread list, from `Box::into_raw`. A crash on this
    /// thread writes its context into it, and being a raw pointer it keeps the
    /// guard on the thread that took the lock.
    record: *mut ThreadRecord,
    tid: libc::pid_t,
    signalled: u32,
}

impl Suspension {
    /// The number of threads that were sent the pause signal
    #[inline]
    pub fn signalled(&self) -> u32 {
        self.signalled
    }

    /// The number of threads that have checked in
    #[inline]
    pub fn paused(&self) -> u32 {
        COORDINATOR.paused.count()
    }

    /// The ids of the paused threads, in reverse order of checking in
    pub fn threads(&self) -> impl Iterator<Item = libc::pid_t> + '_ {
        // SAFETY: every thread in the list is blocked until we are dropped
        unsafe { COORDINATOR.thread_list().iter() }
            .map(|rec| rec.tid as libc::pid_t)
            .filter(|tid| *tid != self.tid)
    }

    /// True if `tid` is paused
    pub fn contains(&self, tid: libc::pid_t) -> bool {
        self.threads().any(|t| t == tid)
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        COORDINATOR.resume_others();

        // SAFETY: the list no longer links to the record
        drop(unsafe { Box::from_raw(self.record) });
    }
}

/// Pauses every other thread in the process, using `/proc/self/task` to find
/// them.
///
/// This blocks if another thread holds a [`Suspension`] or is crashing.
pub fn suspend_threads(timeout: Duration) -> Suspension {
    suspend_threads_with(&mut ProcTaskDir, timeout)
}

/// Pauses every other thread that `source` reports
pub fn suspend_threads_with(source: &mut dyn ThreadSource, timeout: Duration) -> Suspension {
    let tid = gettid();
    let record = Box::into_raw(Box::new(ThreadRecord::new(tid.into(), 0)));

    // SAFETY: the record is leaked until the guard is dropped
    let signalled = unsafe { COORDINATOR.suspend_others(source, &mut *record, timeout) };

    Suspension {
        record,
        tid,
        signalled,
    }
}
