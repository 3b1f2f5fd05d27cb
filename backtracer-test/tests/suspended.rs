//! Crashing on a thread that already holds a suspension skips pausing the
//! other threads again, but must still hand over the crashing thread's context

use backtracer_test::*;

#[test]
fn suspended_segfault() {
    let outcome = run_test(&Run {
        suspended: true,
        ..Run::new(Crash::Segv)
    });

    let context = outcome
        .stdout
        .lines()
        .find(|line| line.starts_with(&format!("thread {}:", outcome.expect("crashed"))))
        .expect("the crashing thread is not listed");
    assert!(!context.ends_with("context 0x0"), "{context}");
}

#[test]
fn suspended_abort_threaded() {
    run_test(&Run {
        suspended: true,
        use_thread: true,
        ..Run::new(Crash::Abort)
    });
}
