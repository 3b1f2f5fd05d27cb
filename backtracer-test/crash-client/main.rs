use backtracer_test::{Crash, MARKER, MARKER_VAR, Server};
use crash_handler::{CrashHandler, OutputTo, Settings, Signal, SpawnBacktracer, Toggle};

use clap::Parser;
use std::{
    os::{raw::c_char, unix::io::RawFd},
    path::PathBuf,
    sync::Barrier,
};

#[derive(Parser)]
struct Command {
    /// The backtracer to run when we crash
    #[clap(long)]
    backtracer: PathBuf,
    /// How to crash
    #[clap(long)]
    crash: Crash,
    /// The number of idle threads to spawn before crashing
    #[clap(long, default_value_t = 4)]
    threads: u32,
    /// Crashes on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// Where the memory server runs
    #[clap(long, default_value_t = Server::Thread)]
    server: Server,
    /// Crashes while holding a suspension of every other thread
    #[clap(long)]
    suspended: bool,
    /// Faults while starting the backtracer instead of starting it
    #[clap(long)]
    faulting_spawner: bool,
}

/// Crashes again in the middle of handling the first crash
struct FaultingSpawner;

impl SpawnBacktracer for FaultingSpawner {
    fn spawn(&self, _argv: &[*const c_char], _memserver_fd: RawFd) -> bool {
        const MSG: &str = "spawner: faulting\n";

        // SAFETY: we're crashing on purpose, again
        unsafe {
            libc::write(1, MSG.as_ptr().cast(), MSG.len());
            backtracer_test::raise(Crash::Segv);
        }
        false
    }
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    println!("pid: {}", std::process::id());

    // The backtracer inherits our environment as it was when attaching
    // SAFETY: no other threads exist yet
    unsafe {
        std::env::set_var(
            MARKER_VAR,
            format!("{:x} {}", MARKER.as_ptr() as usize, MARKER.len()),
        );
    }

    // We want these, not the stack overflow reporting from std
    Signal::Segv.reset_default();
    Signal::Bus.reset_default();

    let settings = Settings {
        interactive: Toggle::Off,
        color: Toggle::Off,
        output_to: OutputTo::Stdout,
        backtracer_path: Some(cmd.backtracer),
        memserver: cmd.server.into(),
        ..Default::default()
    };
    let _handler = if cmd.faulting_spawner {
        CrashHandler::attach_with(settings, Box::new(FaultingSpawner))?
    } else {
        CrashHandler::attach(settings)?
    };

    let ready = std::sync::Arc::new(Barrier::new(cmd.threads as usize + 1));
    for _ in 0..cmd.threads {
        let ready = ready.clone();
        std::thread::spawn(move || {
            ready.wait();
            std::thread::sleep(std::time::Duration::MAX);
        });
    }
    ready.wait();

    let crash = cmd.crash;
    let suspended = cmd.suspended;
    let raise = move || -> anyhow::Result<()> {
        crash_handler::install_signal_handlers()?;
        println!("crashing thread: {}", crash_handler::gettid());

        let suspension = suspended
            .then(|| crash_handler::suspend_threads(crash_handler::SUSPEND_TIMEOUT));

        // SAFETY: we're about to intentionally crash ourselves, none of this
        // is safe
        unsafe { backtracer_test::raise(crash) };

        drop(suspension);
        Ok(())
    };

    if cmd.use_thread {
        std::thread::spawn(raise)
            .join()
            .map_err(|_err| anyhow::anyhow!("crashing thread panicked"))??;
    } else {
        raise()?;
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // We want this program to crash and have the backtracer run, it
    // _shouldn't_ have errors that prevent that from happening, so emit an
    // error code if we do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {:#}", e);

        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
