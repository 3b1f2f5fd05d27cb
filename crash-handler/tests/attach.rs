mod shared;

use crash_handler::{CrashHandler, Error, Settings, Signal};
use shared::handler_of;

#[test]
fn attach_detach() {
    Signal::Segv.reset_default();
    Signal::Bus.reset_default();

    assert!(matches!(
        CrashHandler::attach(Settings::default()),
        Err(Error::NoBacktracer)
    ));

    let disabled = CrashHandler::attach(Settings {
        enabled: false,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(handler_of(libc::SIGSEGV), libc::SIG_DFL);
    drop(disabled);

    let settings = Settings {
        backtracer_path: Some("/bin/true".into()),
        ..Default::default()
    };

    let handler = CrashHandler::attach(settings.clone()).unwrap();
    assert_ne!(handler_of(libc::SIGSEGV), libc::SIG_DFL);

    assert!(matches!(
        CrashHandler::attach(settings.clone()),
        Err(Error::HandlerAlreadyInstalled)
    ));

    handler.detach();
    for sig in [libc::SIGSEGV, libc::SIGABRT, libc::SIGQUIT] {
        assert_eq!(handler_of(sig), libc::SIG_DFL);
    }

    // Detaching lets us attach again
    let handler = CrashHandler::attach(settings).unwrap();
    assert_ne!(handler_of(libc::SIGABRT), libc::SIG_DFL);
    drop(handler);
    assert_eq!(handler_of(libc::SIGABRT), libc::SIG_DFL);
}
