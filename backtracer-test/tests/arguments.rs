//! The backtracer's command line and environment

use backtracer_test::*;

#[test]
fn resolved_arguments() {
    let outcome = run_test(&Run::new(Crash::Segv));

    assert_eq!(outcome.expect("unwind"), "precise");
    // Not interactive, so the full report is asked for
    assert_eq!(outcome.expect("interactive"), "false");
    assert_eq!(outcome.expect("preset"), "full");
    assert_eq!(outcome.expect("output-to"), "stdout");
    assert_eq!(outcome.expect("limit"), "64");
    assert_eq!(outcome.expect("top"), "16");
    assert_eq!(outcome.expect("timeout"), "30");

    // The bad read is reported and the server keeps going
    assert!(outcome.expect("null read").contains("unreadable"));
    assert!(outcome.field("backtracer error").is_none());
}
