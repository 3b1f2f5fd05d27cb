#![allow(dead_code)]

use std::{
    mem, ptr,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
};

/// The address of the handler currently installed for `sig`
pub fn handler_of(sig: libc::c_int) -> usize {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(sig, ptr::null(), &mut sa), 0);
        sa.sa_sigaction
    }
}

/// A set of threads that spin until they are told to stop
pub struct Workers {
    pub tids: Vec<libc::pid_t>,
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(count: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(count + 1));
        let (tx, rx) = mpsc::channel();

        let handles = (0..count)
            .map(|_| {
                let stop = stop.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    tx.send(crash_handler::gettid()).unwrap();
                    drop(tx);
                    barrier.wait();

                    // Nothing in here may allocate, we are paused at arbitrary
                    // points
                    while !stop.load(Ordering::Relaxed) {
                        std::hint::spin_loop();
                        unsafe { libc::sched_yield() };
                    }
                })
            })
            .collect();

        drop(tx);
        let tids = rx.iter().collect();
        barrier.wait();

        Self {
            tids,
            stop,
            handles,
        }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for h in self.handles {
            h.join().unwrap();
        }
    }
}
