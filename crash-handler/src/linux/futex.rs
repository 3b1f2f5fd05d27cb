//! The only blocking primitives that are used while handling a crash, both
//! are plain atomics with `futex` as the fallback when they have to wait.

use std::{
    ptr,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

/// Blocks while `word` still holds `expected`, returns the errno on failure
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<&libc::timespec>) -> i32 {
    // SAFETY: syscall, `word` outlives the call
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            timeout.map_or(ptr::null(), |ts| ts as *const _),
        )
    };

    if ret < 0 { errno::errno().0 } else { 0 }
}

fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: syscall
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
}

/// The global thread lock.
///
/// Held by the crashing thread for the whole crash, and by a suspension until
/// every thread it paused is running again. Any other thread that crashes or
/// suspends concurrently blocks on it. The lock word holds the tid of the
/// owner, or 0 if unlocked.
pub(crate) struct ThreadLock(AtomicU32);

impl ThreadLock {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn lock(&self, tid: libc::pid_t) {
        let tid = tid as u32;

        loop {
            match self
                .0
                .compare_exchange_weak(0, tid, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(0) => {}
                // EAGAIN and EINTR both mean we just try again
                Err(owner) => {
                    futex_wait(&self.0, owner, None);
                }
            }
        }
    }

    pub(crate) fn unlock(&self) {
        self.0.store(0, Ordering::Release);
        futex_wake(&self.0, 1);
    }

    /// The tid of the thread holding the lock, or 0
    #[inline]
    pub(crate) fn owner(&self) -> libc::pid_t {
        self.0.load(Ordering::Relaxed) as libc::pid_t
    }
}

/// Counts the threads that have checked in as paused
pub(crate) struct PauseCounter(AtomicU32);

impl PauseCounter {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn notify(&self) {
        self.0.fetch_add(1, Ordering::Release);
        futex_wake(&self.0, 1);
    }

    /// Waits until at least `target` threads have checked in, or `timeout`
    /// has elapsed.
    ///
    /// Returns true if the target was reached.
    pub(crate) fn wait_for(&self, target: u32, timeout: Duration) -> bool {
        wait_until(&self.0, timeout, |current| current >= target)
    }
}

/// Waits until `done` holds for the value of `word`, or `timeout` has elapsed
fn wait_until(word: &AtomicU32, timeout: Duration, done: impl Fn(u32) -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        let current = word.load(Ordering::Acquire);
        if done(current) {
            return true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }

        let ts = libc::timespec {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_nsec: remaining.subsec_nanos() as libc::c_long,
        };
        futex_wait(word, current, Some(&ts));
    }
}

/// Closed for the duration of a suspension, paused threads wait for it to
/// open again
pub(crate) struct Gate(AtomicU32);

impl Gate {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub(crate) fn close(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub(crate) fn open(&self) {
        self.0.store(0, Ordering::Release);
        futex_wake(&self.0, i32::MAX);
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub(crate) fn wait_open(&self) {
        // EAGAIN and EINTR both mean we just check again
        while self.is_closed() {
            futex_wait(&self.0, 1, None);
        }
    }
}

/// The number of threads currently running the pause handler
pub(crate) struct Occupancy(AtomicU32);

impl Occupancy {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub(crate) fn enter(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        if self.0.fetch_sub(1, Ordering::AcqRel) == 1 {
            futex_wake(&self.0, i32::MAX);
        }
    }

    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Waits until every thread has left, or `timeout` has elapsed.
    ///
    /// Returns true if nobody is left inside.
    pub(crate) fn wait_empty(&self, timeout: Duration) -> bool {
        wait_until(&self.0, timeout, |current| current == 0)
    }
}
