//! The thread lock is not reentrant, attaching and detaching on the thread
//! that holds a suspension must not wait for it

mod shared;

use crash_handler::{CrashHandler, Settings, Signal};
use shared::handler_of;

#[test]
fn attach_while_suspended() {
    Signal::Segv.reset_default();
    Signal::Bus.reset_default();

    // The workers never allocate, so allocating while they are paused is fine
    let workers = shared::Workers::spawn(2);
    let suspension = crash_handler::suspend_threads(crash_handler::SUSPEND_TIMEOUT);

    let handler = CrashHandler::attach(Settings {
        backtracer_path: Some("/bin/true".into()),
        ..Default::default()
    })
    .unwrap();
    assert_ne!(handler_of(libc::SIGSEGV), libc::SIG_DFL);

    handler.detach();
    assert_eq!(handler_of(libc::SIGSEGV), libc::SIG_DFL);

    for tid in &workers.tids {
        assert!(suspension.contains(*tid));
    }
    drop(suspension);

    workers.stop();
}
