//! Suspending again straight after a suspension ends must catch every thread
//! again, including ones that are still on their way out of the pause handler
//! of the previous round, and must leave no pause signal pending behind

mod shared;

use std::time::{Duration, Instant};

#[test]
fn suspends_back_to_back() {
    const WORKERS: usize = 2;
    const ROUNDS: usize = 10;

    let workers = shared::Workers::spawn(WORKERS);

    for round in 0..ROUNDS {
        let start = Instant::now();
        let suspension = crash_handler::suspend_threads(crash_handler::SUSPEND_TIMEOUT);
        let elapsed = start.elapsed();

        assert_eq!(
            suspension.paused(),
            suspension.signalled(),
            "round {round} missed a thread"
        );
        for tid in &workers.tids {
            assert!(suspension.contains(*tid), "round {round} missed worker {tid}");
        }
        assert!(elapsed < Duration::from_secs(4), "round {round} took {elapsed:?}");

        drop(suspension);
    }

    // A pause signal left pending would kill us once the workers return from
    // the handler
    std::thread::sleep(Duration::from_millis(200));

    workers.stop();
}
