//! The memory server as a child process, which can only read memory that was
//! mapped when it was forked

use backtracer_test::*;

#[test]
fn process_server_segfault() {
    run_test(&Run {
        server: Server::Process,
        ..Run::new(Crash::Segv)
    });
}

#[test]
fn process_server_abort_threaded() {
    run_test(&Run {
        server: Server::Process,
        use_thread: true,
        ..Run::new(Crash::Abort)
    });
}
