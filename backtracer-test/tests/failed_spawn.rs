//! A backtracer that can't be started must not keep the crash from killing
//! the process with the signal it raised

use backtracer_test::*;

fn assert_dies_without_backtrace(crash: Crash) {
    let outcome = run_client(&Run {
        backtracer: Backtracer::Missing,
        ..Run::new(crash)
    });

    assert_eq!(outcome.signal, Some(crash.signal()));
    assert!(outcome.field("crashing thread").is_some());
    assert!(outcome.field("crashed").is_none(), "a backtracer ran");
}

#[test]
fn failed_spawn_segfault() {
    assert_dies_without_backtrace(Crash::Segv);
}

#[test]
fn failed_spawn_abort() {
    assert_dies_without_backtrace(Crash::Abort);
}
