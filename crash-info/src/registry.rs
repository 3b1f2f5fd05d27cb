use crate::ThreadRecord;
use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, singly linked list of [`ThreadRecord`]s.
///
/// The list is built concurrently from signal handlers, one push per paused
/// thread, and is never popped from. The nodes are owned by whoever pushed
/// them, the list only stores their addresses, so it is up to the caller to
/// keep every pushed record alive, and in place, until the list is reset or
/// cleared.
///
/// The head is stored as a plain 64-bit word so that the list is readable
/// from another process through [`crate::CrashInfo::thread_list`].
#[repr(transparent)]
#[derive(Debug)]
pub struct ThreadList(AtomicU64);

impl ThreadList {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) const fn with_head(head: u64) -> Self {
        Self(AtomicU64::new(head))
    }

    /// The address of the first record, or 0 if the list is empty
    #[inline]
    pub fn head(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Resets the list so that it contains only `first`.
    ///
    /// # Safety
    ///
    /// `first` must stay alive and must not move until the list is reset or
    /// cleared again.
    pub unsafe fn reset(&self, first: &mut ThreadRecord) {
        first.next = 0;
        self.0
            .store(first as *mut ThreadRecord as u64, Ordering::Release);
    }

    /// Empties the list.
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Pushes a record onto the front of the list.
    ///
    /// This is safe to call concurrently from any number of threads, including
    /// from signal handlers, it neither allocates nor blocks.
    ///
    /// # Safety
    ///
    /// The same requirements as [`Self::reset`] apply to `record`.
    pub unsafe fn push(&self, record: &mut ThreadRecord) {
        let new = record as *mut ThreadRecord as u64;
        let mut head = self.0.load(Ordering::Acquire);

        loop {
            record.next = head;
            match self
                .0
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Checks if a record for `tid` has been pushed.
    ///
    /// This never mutates the list and may run concurrently with [`Self::push`],
    /// a record pushed during the walk may or may not be observed.
    ///
    /// # Safety
    ///
    /// Every record in the list must still be alive, ie. the list was built in
    /// this process and none of its owners have returned.
    pub unsafe fn contains(&self, tid: i64) -> bool {
        unsafe { self.iter() }.any(|rec| rec.tid == tid)
    }

    /// Iterates over the records, most recently pushed first.
    ///
    /// # Safety
    ///
    /// See [`Self::contains`].
    pub unsafe fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head(),
            _list: std::marker::PhantomData,
        }
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'list> {
    next: u64,
    _list: std::marker::PhantomData<&'list ThreadList>,
}

impl<'list> Iterator for Iter<'list> {
    type Item = &'list ThreadRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }

        // SAFETY: the caller of `ThreadList::iter` guarantees every linked
        // record is alive
        let rec = unsafe { &*(self.next as *const ThreadRecord) };
        self.next = rec.next;
        Some(rec)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn reset_then_push() {
        let list = ThreadList::new();
        assert_eq!(list.head(), 0);

        let mut first = ThreadRecord::new(1, 0);
        first.next = 0xdead;
        let mut second = ThreadRecord::new(2, 0);

        unsafe {
            list.reset(&mut first);
            assert_eq!(first.next, 0);
            list.push(&mut second);

            let tids: Vec<_> = list.iter().map(|r| r.tid).collect();
            assert_eq!(tids, [2, 1]);
            assert!(list.contains(1));
            assert!(list.contains(2));
            assert!(!list.contains(3));
        }

        list.clear();
        assert_eq!(unsafe { list.iter() }.count(), 0);
    }

    /// Many threads racing to push their own record must all end up in the
    /// list exactly once
    #[test]
    fn concurrent_pushes() {
        const THREADS: usize = 32;
        const ROUNDS: usize = 64;

        let list = ThreadList::new();
        let barrier = Barrier::new(THREADS);

        let mut records: Vec<Vec<ThreadRecord>> = (0..THREADS)
            .map(|t| {
                (0..ROUNDS)
                    .map(|r| ThreadRecord::new((t * ROUNDS + r) as i64, t as u64))
                    .collect()
            })
            .collect();

        std::thread::scope(|s| {
            for recs in records.iter_mut() {
                let list = &list;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for rec in recs.iter_mut() {
                        unsafe { list.push(rec) };
                    }
                });
            }
        });

        let mut tids: Vec<_> = unsafe { list.iter() }.map(|r| r.tid).collect();
        assert_eq!(tids.len(), THREADS * ROUNDS);

        tids.sort_unstable();
        tids.dedup();
        assert_eq!(tids.len(), THREADS * ROUNDS, "duplicate records were linked");
        assert_eq!(tids.first(), Some(&0));
        assert_eq!(tids.last(), Some(&((THREADS * ROUNDS - 1) as i64)));
    }

    /// Lookups while pushes are in flight must never observe a torn list
    #[test]
    fn contains_during_pushes() {
        const THREADS: usize = 8;

        let list = ThreadList::new();
        let mut root = ThreadRecord::new(-1, 0);
        unsafe { list.reset(&mut root) };

        let seen = parking_lot::Mutex::new(0usize);
        let mut records: Vec<_> = (0..THREADS as i64)
            .map(|tid| ThreadRecord::new(tid, 0))
            .collect();

        std::thread::scope(|s| {
            for rec in records.iter_mut() {
                let list = &list;
                s.spawn(move || unsafe { list.push(rec) });
            }

            s.spawn(|| {
                loop {
                    let found = (0..THREADS as i64)
                        .filter(|tid| unsafe { list.contains(*tid) })
                        .count();
                    assert!(unsafe { list.contains(-1) });
                    *seen.lock() = found;
                    if found == THREADS {
                        break;
                    }
                    std::thread::yield_now();
                }
            });
        });

        assert_eq!(*seen.lock(), THREADS);
    }
}
