//! A fault while the crash is being handled kills the process on the spot,
//! with the signal of the second fault

use backtracer_test::*;

fn assert_second_fault_kills(server: Server) {
    let outcome = run_client(&Run {
        backtracer: Backtracer::Faulting,
        server,
        ..Run::new(Crash::Abort)
    });

    assert_eq!(outcome.field("spawner"), Some("faulting"));
    assert_eq!(outcome.signal, Some(libc::SIGSEGV));
    assert!(outcome.field("crashed").is_none());
}

#[test]
fn nested_fault_thread_server() {
    assert_second_fault_kills(Server::Thread);
}

#[test]
fn nested_fault_process_server() {
    assert_second_fault_kills(Server::Process);
}
