//! A thread that exits between being listed and being signalled must neither
//! fail the suspension nor make it wait for the timeout

mod shared;

use crash_handler::ThreadSource;
use std::{
    io,
    time::{Duration, Instant},
};

/// Reports the live workers, plus a thread that has already exited
struct WithGhost {
    live: Vec<libc::pid_t>,
    ghost: libc::pid_t,
}

impl ThreadSource for WithGhost {
    fn for_each_thread(&mut self, f: &mut dyn FnMut(libc::pid_t)) -> io::Result<()> {
        f(self.ghost);
        for tid in &self.live {
            f(*tid);
        }
        Ok(())
    }
}

#[test]
fn ignores_exited_thread() {
    let ghost = std::thread::spawn(crash_handler::gettid).join().unwrap();
    let workers = shared::Workers::spawn(4);

    let mut source = WithGhost {
        live: workers.tids.clone(),
        ghost,
    };

    let start = Instant::now();
    let suspension = crash_handler::suspend_threads_with(&mut source, Duration::from_secs(5));
    let elapsed = start.elapsed();

    assert_eq!(suspension.signalled(), 4);
    assert_eq!(suspension.paused(), 4);
    assert!(!suspension.contains(ghost));
    for tid in &workers.tids {
        assert!(suspension.contains(*tid));
    }
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");

    drop(suspension);
    workers.stop();
}
