//! Runs `crash-client`, which attaches a crash handler and then crashes, with
//! `fake-backtracer` as its backtracer, and collects what they both printed.

use std::{fmt, os::unix::process::ExitStatusExt, path::PathBuf, process::Command};

/// The ways `crash-client` can crash
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crash {
    Abort,
    Bus,
    Fpe,
    Illegal,
    Quit,
    Segv,
    Trap,
}

impl Crash {
    /// The signal the crash raises, which is also what kills the process
    pub fn signal(self) -> i32 {
        match self {
            Self::Abort => libc::SIGABRT,
            Self::Bus => libc::SIGBUS,
            Self::Fpe => libc::SIGFPE,
            Self::Illegal => libc::SIGILL,
            Self::Quit => libc::SIGQUIT,
            Self::Segv => libc::SIGSEGV,
            Self::Trap => libc::SIGTRAP,
        }
    }
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Bus => "bus",
            Self::Fpe => "fpe",
            Self::Illegal => "illegal",
            Self::Quit => "quit",
            Self::Segv => "segv",
            Self::Trap => "trap",
        })
    }
}

/// Where the memory server runs
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Server {
    #[default]
    Thread,
    Process,
}

impl From<Server> for memserver::Mode {
    fn from(s: Server) -> Self {
        match s {
            Server::Thread => Self::Thread,
            Server::Process => Self::Process,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Thread => "thread",
            Self::Process => "process",
        })
    }
}

/// Crashes the calling thread.
///
/// # Safety
///
/// There is nothing safe about this.
pub unsafe fn raise(crash: Crash) {
    unsafe {
        match crash {
            Crash::Abort => std::process::abort(),
            Crash::Bus => raise_bus(),
            Crash::Fpe => raise_fpe(),
            Crash::Illegal => raise_illegal(),
            Crash::Quit => {
                libc::raise(libc::SIGQUIT);
            }
            Crash::Segv => {
                // avoid the deref_nullptr lint
                fn definitely_not_null() -> *mut u32 {
                    std::ptr::null_mut()
                }
                std::ptr::write_volatile(definitely_not_null(), 0xdead);
            }
            Crash::Trap => raise_trap(),
        }
    }
}

/// Touches a shared mapping past the end of an empty file
unsafe fn raise_bus() {
    let path = std::env::temp_dir().join(format!("crash-client-bus-{}", std::process::id()));
    let Ok(path) = std::ffi::CString::new(path.into_os_string().into_encoded_bytes()) else {
        return;
    };

    unsafe {
        let fd = libc::open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            0o600,
        );
        libc::unlink(path.as_ptr());

        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if mapping == libc::MAP_FAILED {
            return;
        }

        std::ptr::read_volatile(mapping.cast::<u8>().add(1));
    }
}

unsafe fn raise_fpe() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe {
                std::arch::asm!(
                    "mov eax, 1",
                    "cdq",
                    "mov {div:e}, 0",
                    "idiv {div:e}",
                    div = out(reg) _,
                    out("eax") _,
                    out("edx") _,
                );
            }
        } else {
            // Integer division by zero doesn't trap everywhere
            unsafe { libc::raise(libc::SIGFPE) };
        }
    }
}

unsafe fn raise_illegal() {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
            unsafe { std::arch::asm!("ud2") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { std::arch::asm!("udf #0") };
        } else {
            unsafe { libc::raise(libc::SIGILL) };
        }
    }
}

unsafe fn raise_trap() {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
            unsafe { std::arch::asm!("int3") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { std::arch::asm!("brk #0") };
        } else {
            unsafe { libc::raise(libc::SIGTRAP) };
        }
    }
}

/// What `crash-client` runs when it crashes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backtracer {
    /// `fake-backtracer`
    Fake,
    /// A path that doesn't exist, so the backtracer can't be started
    Missing,
    /// Faults while starting the backtracer, ie. in the middle of handling
    /// the crash
    Faulting,
}

/// The options `crash-client` is run with
#[derive(Clone, Debug)]
pub struct Run {
    pub crash: Crash,
    /// The number of idle threads to spawn before crashing
    pub threads: u32,
    /// Crash on a spawned thread rather than the main thread
    pub use_thread: bool,
    /// Crash while holding a suspension of every other thread
    pub suspended: bool,
    pub server: Server,
    pub backtracer: Backtracer,
}

impl Run {
    pub fn new(crash: Crash) -> Self {
        Self {
            crash,
            threads: 4,
            use_thread: false,
            suspended: false,
            server: Server::Thread,
            backtracer: Backtracer::Fake,
        }
    }
}

/// What a crashed `crash-client` left behind
pub struct Outcome {
    /// Everything printed to stdout, by both the client and the backtracer
    pub stdout: String,
    pub stderr: String,
    /// The signal that killed the client
    pub signal: Option<i32>,
}

impl Outcome {
    /// The value printed on the first `key: value` line for `key`
    pub fn field(&self, key: &str) -> Option<&str> {
        self.stdout.lines().find_map(|line| {
            let (k, v) = line.split_once(": ")?;
            (k == key).then_some(v)
        })
    }

    /// Like [`Self::field`], but panics if the field is missing
    pub fn expect(&self, key: &str) -> &str {
        self.field(key)
            .unwrap_or_else(|| panic!("'{key}' was not printed:\n{}", self.stdout))
    }
}

/// Path of one of the binaries in this package, from within a test
fn bin_path(name: &str) -> PathBuf {
    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut path = std::env::current_exe().expect("failed to get exe path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }

    path.push(name);
    path
}

/// Runs `crash-client` to completion
pub fn run_client(run: &Run) -> Outcome {
    let backtracer = match run.backtracer {
        Backtracer::Missing => PathBuf::from("/nonexistent/fake-backtracer"),
        Backtracer::Fake | Backtracer::Faulting => bin_path("fake-backtracer"),
    };

    let mut cmd = Command::new(bin_path("crash-client"));
    cmd.arg("--backtracer")
        .arg(backtracer)
        .args(["--crash", &run.crash.to_string()])
        .args(["--threads", &run.threads.to_string()])
        .args(["--server", &run.server.to_string()]);
    if run.use_thread {
        cmd.arg("--use-thread");
    }
    if run.suspended {
        cmd.arg("--suspended");
    }
    if run.backtracer == Backtracer::Faulting {
        cmd.arg("--faulting-spawner");
    }
    // Settings from whoever is running the tests must not leak in
    cmd.env_remove(crash_handler::ENV_VAR);

    let output = cmd.output().expect("failed to run crash-client");

    let stdout = String::from_utf8(output.stdout).expect("invalid stdout");
    let stderr = String::from_utf8(output.stderr).expect("invalid stderr");

    println!("{stdout}");
    eprintln!("{stderr}");

    Outcome {
        stdout,
        stderr,
        signal: output.status.signal(),
    }
}

/// Runs `crash-client` and checks the things every crash should agree on
pub fn run_test(run: &Run) -> Outcome {
    let outcome = run_client(run);

    assert_eq!(
        outcome.signal,
        Some(run.crash.signal()),
        "crash-client was not killed by the signal it raised"
    );

    assert_eq!(outcome.expect("crashing thread"), outcome.expect("crashed"));
    assert_eq!(outcome.expect("signal"), run.crash.signal().to_string());
    assert_eq!(outcome.expect("marker"), MARKER);
    assert_eq!(outcome.expect("contexts"), "readable");
    assert_eq!(outcome.expect("settings"), "enable=no");

    let expected = run.threads + 1 + u32::from(run.use_thread);
    assert_eq!(outcome.expect("threads"), expected.to_string());

    outcome
}

/// Text the client puts in its memory for the backtracer to find
pub const MARKER: &str = "the crashed process's memory, read from outside";

/// The environment variable the client puts the address of [`MARKER`] in
pub const MARKER_VAR: &str = "BACKTRACER_TEST_MARKER";
