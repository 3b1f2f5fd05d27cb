pub mod backtracer;
mod coordinator;
mod futex;
mod state;
mod suspend;
pub mod threads;

use crate::{Error, Settings};
use backtracer::{ExecSpawner, Launcher, SpawnBacktracer};

pub use coordinator::{CrashState, SUSPEND_TIMEOUT};
pub(crate) use coordinator::COORDINATOR;
pub use suspend::{Suspension, suspend_threads, suspend_threads_with};

/// The signals that we handle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Quit = libc::SIGQUIT,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    /// Resets the signal to its default disposition.
    ///
    /// std installs handlers for `SIGSEGV` and `SIGBUS` to report stack
    /// overflows, which [`install_signal_handlers`] leaves alone like any
    /// other handler, so reset them first to have us handle those signals.
    #[inline]
    pub fn reset_default(self) {
        // SAFETY: syscall
        unsafe { state::set_default_handler(self as i32) };
    }
}

/// Where the crash sequence currently is, this is [`CrashState::Idle`] until
/// something crashes
#[inline]
pub fn crash_state() -> CrashState {
    COORDINATOR.state()
}

/// Installs an alternate signal stack for the calling thread, if it has none,
/// and our handler for every fatal signal that has its default disposition.
///
/// Signals that already have a handler, eg. from a language runtime or
/// another crash reporter, are left alone, and calling this more than once
/// changes nothing.
///
/// The alternate stack is per thread, threads that might crash should call
/// this themselves, as the one std installs is too small for the crash
/// sequence.
///
/// Without a [`CrashHandler`] attached a crash still pauses every thread and
/// fills in the [`crate::CrashInfo`], but no backtracer is run.
pub fn install_signal_handlers() -> Result<(), Error> {
    // SAFETY: syscalls
    unsafe {
        state::install_sigaltstack()?;
        state::install_handlers()
    }
}

static ATTACHED: parking_lot::Mutex<bool> = parking_lot::const_mutex(false);

/// A Linux/Android crash handler that runs a backtracer when we crash.
///
/// Only one can be attached at a time.
pub struct CrashHandler {
    armed: bool,
}

impl CrashHandler {
    /// Attaches the crash handler, running the executable in
    /// [`Settings::backtracer_path`] on a crash.
    ///
    /// If [`Settings::enabled`] is false nothing is installed.
    pub fn attach(settings: Settings) -> Result<Self, Error> {
        if !settings.enabled {
            log::debug!("backtracing is disabled");
            return Ok(Self { armed: false });
        }

        let path = settings.backtracer_path.as_deref().ok_or(Error::NoBacktracer)?;
        let spawner = ExecSpawner::new(path)?;
        Self::attach_with(settings, Box::new(spawner))
    }

    /// Attaches the crash handler, starting the backtracer with `spawner`
    /// rather than the default [`ExecSpawner`].
    ///
    /// [`Settings::enabled`] is ignored.
    pub fn attach_with(
        settings: Settings,
        spawner: Box<dyn SpawnBacktracer>,
    ) -> Result<Self, Error> {
        let mut attached = ATTACHED.lock();

        if *attached {
            return Err(Error::HandlerAlreadyInstalled);
        }

        // Anything that depends on the terminal is decided now, as we can't
        // allocate later
        let launcher = Launcher::new(settings.resolve(), spawner)?;

        install_signal_handlers()?;
        COORDINATOR.set_launcher(Some(Box::new(launcher)));

        *attached = true;
        log::debug!("crash handler attached");

        Ok(Self { armed: true })
    }

    /// Detaches the handler, restoring the default dispositions of the
    /// signals we installed our handler for.
    ///
    /// This is done automatically when this [`CrashHandler`] is dropped.
    #[inline]
    pub fn detach(self) {}
}

impl Drop for CrashHandler {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut attached = ATTACHED.lock();

        // SAFETY: syscalls
        unsafe { state::uninstall_handlers() };
        COORDINATOR.set_launcher(None);

        *attached = false;
        log::debug!("crash handler detached");
    }
}
