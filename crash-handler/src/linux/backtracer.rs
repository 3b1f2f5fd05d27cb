use crate::{
    Error, Settings,
    format::{ADDRESS_LEN, UNSIGNED_LEN, format_address, format_unsigned},
    settings::bool_arg,
};
use std::{
    cell::UnsafeCell,
    ffi::{CStr, CString},
    os::{
        raw::c_char,
        unix::{
            ffi::{OsStrExt, OsStringExt},
            io::RawFd,
        },
    },
    path::Path,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// The fd the backtracer finds the memory server socket on
pub const MEMSERVER_FD: RawFd = 4;

/// The program name and 15 flag/value pairs
const ARGC: usize = 31;

/// Settings for a backtracer started by a crashing process, so that it
/// doesn't try to handle its own crashes the same way
const CHILD_SETTINGS: &CStr = c"CRASH_BACKTRACE=enable=no";

/// The backtracer's command line.
///
/// The vector points into buffers owned by this struct, so it is built in
/// place, at crash time, without allocating.
pub struct BacktracerArgs {
    argv: [*const c_char; ARGC + 1],
    crashinfo: [u8; ADDRESS_LEN],
    timeout: [u8; UNSIGNED_LEN],
    limit: [u8; UNSIGNED_LEN],
    top: [u8; UNSIGNED_LEN],
}

// SAFETY: the pointers are either static or point into the struct itself,
// and are only handed out while it is borrowed
unsafe impl Send for BacktracerArgs {}

impl BacktracerArgs {
    pub const fn new() -> Self {
        Self {
            argv: [ptr::null(); ARGC + 1],
            crashinfo: [0; ADDRESS_LEN],
            timeout: [0; UNSIGNED_LEN],
            limit: [0; UNSIGNED_LEN],
            top: [0; UNSIGNED_LEN],
        }
    }

    /// Fills in the arguments, returning the nul terminated vector to hand
    /// to `execve`.
    ///
    /// This is async signal safe.
    pub fn build(
        &mut self,
        program: &CStr,
        settings: &Settings,
        crash_info: u64,
    ) -> &[*const c_char] {
        let crashinfo = format_address(crash_info, &mut self.crashinfo).as_ptr();
        let timeout = format_unsigned(settings.timeout.as_secs(), &mut self.timeout).as_ptr();
        let limit = match settings.limit {
            Some(limit) => format_unsigned(limit.into(), &mut self.limit).as_ptr(),
            None => c"none".as_ptr(),
        };
        let top = format_unsigned(settings.top.into(), &mut self.top).as_ptr();

        self.argv = [
            program.as_ptr(),
            c"--unwind".as_ptr(),
            settings.unwind.as_arg().as_ptr(),
            c"--demangle".as_ptr(),
            bool_arg(settings.demangle).as_ptr(),
            c"--interactive".as_ptr(),
            bool_arg(settings.interactive.is_on()).as_ptr(),
            c"--color".as_ptr(),
            bool_arg(settings.color.is_on()).as_ptr(),
            c"--timeout".as_ptr(),
            timeout,
            c"--preset".as_ptr(),
            settings.preset.as_arg().as_ptr(),
            c"--crashinfo".as_ptr(),
            crashinfo,
            c"--threads".as_ptr(),
            settings.threads.as_arg().as_ptr(),
            c"--registers".as_ptr(),
            settings.registers.as_arg().as_ptr(),
            c"--images".as_ptr(),
            settings.images.as_arg().as_ptr(),
            c"--limit".as_ptr(),
            limit,
            c"--top".as_ptr(),
            top,
            c"--sanitize".as_ptr(),
            settings.sanitize.as_arg().as_ptr(),
            c"--cache".as_ptr(),
            bool_arg(settings.cache).as_ptr(),
            c"--output-to".as_ptr(),
            settings.output_to.as_arg().as_ptr(),
            ptr::null(),
        ];

        &self.argv
    }
}

impl Default for BacktracerArgs {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the backtracer.
///
/// [`ExecSpawner`] is what is used by default, this is the seam for running
/// the backtracer some other way, eg. through a sandbox broker.
pub trait SpawnBacktracer: Send + Sync {
    /// Runs the backtracer with the nul terminated `argv`, handing it
    /// `memserver_fd` as [`MEMSERVER_FD`], and waits for it to exit.
    ///
    /// Returns false if the backtracer could not be started, its exit status
    /// is of no interest.
    ///
    /// This is called from a signal handler with every other thread paused,
    /// so it must be async signal safe, and must not allocate.
    fn spawn(&self, argv: &[*const c_char], memserver_fd: RawFd) -> bool;
}

/// Runs the backtracer with `clone(CLONE_VM | CLONE_VFORK)` and `execve`.
///
/// `posix_spawn` would be the obvious choice, but its file actions allocate.
pub struct ExecSpawner {
    path: CString,
    _env: Vec<CString>,
    envp: Vec<*const c_char>,
}

// SAFETY: `envp` points into `_env`, neither is mutated after construction
unsafe impl Send for ExecSpawner {}
unsafe impl Sync for ExecSpawner {}

impl ExecSpawner {
    /// Prepares to run the executable at `path`, with the current environment
    pub fn new(path: &Path) -> Result<Self, Error> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_e| Error::InvalidPath)?;

        let mut env: Vec<CString> = std::env::vars_os()
            .filter(|(key, _)| key.to_str() != Some(crate::settings::ENV_VAR))
            .filter_map(|(key, value)| {
                let mut pair = key.into_vec();
                pair.push(b'=');
                pair.extend_from_slice(value.as_bytes());
                CString::new(pair).ok()
            })
            .collect();
        env.push(CHILD_SETTINGS.to_owned());

        let envp = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        Ok(Self {
            path,
            _env: env,
            envp,
        })
    }
}

struct ExecArgs {
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    fd: RawFd,
    /// Set by the child if it fails, the parent only reads it once the child
    /// has exited or exec'd
    errno: i32,
}

const SPAWN_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct SpawnStack([u8; SPAWN_STACK_SIZE]);

static mut SPAWN_STACK: SpawnStack = SpawnStack([0; SPAWN_STACK_SIZE]);
static SPAWNING: AtomicBool = AtomicBool::new(false);

extern "C" fn exec_child(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: syscalls, `arg` points to the parent's `ExecArgs`, and the parent
    // is suspended until we exec or exit
    unsafe {
        let args = &mut *arg.cast::<ExecArgs>();

        // We inherit the mask of the signal handler, which blocks nearly
        // everything, and execve keeps it
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

        let dup_failed = if args.fd == MEMSERVER_FD {
            libc::fcntl(MEMSERVER_FD, libc::F_SETFD, 0) < 0
        } else {
            libc::dup2(args.fd, MEMSERVER_FD) < 0
        };

        if !dup_failed {
            libc::execve(args.path, args.argv, args.envp);
        }

        args.errno = errno::errno().0;
        libc::_exit(127)
    }
}

impl SpawnBacktracer for ExecSpawner {
    fn spawn(&self, argv: &[*const c_char], memserver_fd: RawFd) -> bool {
        if argv.last().is_none_or(|last| !last.is_null()) {
            return false;
        }

        // The child runs on a static stack
        if SPAWNING.swap(true, Ordering::Acquire) {
            return false;
        }

        let mut args = ExecArgs {
            path: self.path.as_ptr(),
            argv: argv.as_ptr(),
            envp: self.envp.as_ptr(),
            fd: memserver_fd,
            errno: 0,
        };

        // SAFETY: syscalls, CLONE_VFORK keeps `args` and the stack alive and
        // untouched by us until the child is done with them
        let spawned = unsafe {
            let stack_top = (&raw mut SPAWN_STACK).cast::<u8>().add(SPAWN_STACK_SIZE);
            let child = libc::clone(
                exec_child,
                stack_top.cast(),
                libc::CLONE_VM | libc::CLONE_VFORK | libc::SIGCHLD,
                (&raw mut args).cast(),
            );

            if child < 0 {
                crate::debug_print!("failed to clone the backtracer");
                false
            } else {
                let mut status = 0;
                while libc::waitpid(child, &mut status, 0) < 0
                    && errno::errno().0 == libc::EINTR
                {}

                args.errno == 0
            }
        };

        SPAWNING.store(false, Ordering::Release);
        spawned
    }
}

/// Everything needed to run the backtracer, prepared before we crash
pub(crate) struct Launcher {
    settings: Settings,
    program: CString,
    args: UnsafeCell<BacktracerArgs>,
    spawner: Box<dyn SpawnBacktracer>,
}

impl Launcher {
    pub(crate) fn new(settings: Settings, spawner: Box<dyn SpawnBacktracer>) -> Result<Self, Error> {
        let path = settings.backtracer_path.as_ref().ok_or(Error::NoBacktracer)?;
        let program = CString::new(path.as_os_str().as_bytes()).map_err(|_e| Error::InvalidPath)?;

        Ok(Self {
            settings,
            program,
            args: UnsafeCell::new(BacktracerArgs::new()),
            spawner,
        })
    }

    #[inline]
    pub(crate) fn memserver_mode(&self) -> memserver::Mode {
        self.settings.memserver
    }

    /// Runs the backtracer to completion.
    ///
    /// # Safety
    ///
    /// The arguments are built in place, so only one thread may run the
    /// launcher at a time, ie. the caller must hold the thread lock.
    pub(crate) unsafe fn run(&self, crash_info: u64, memserver_fd: RawFd) -> bool {
        let args = unsafe { &mut *self.args.get() };
        let argv = args.build(&self.program, &self.settings, crash_info);
        self.spawner.spawn(argv, memserver_fd)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Images, OutputTo, Preset, Registers, Sanitize, Threads, Toggle, Unwind};
    use std::time::Duration;

    fn to_strings(argv: &[*const c_char]) -> Vec<String> {
        argv[..argv.len() - 1]
            .iter()
            .map(|a| {
                unsafe { CStr::from_ptr(*a) }
                    .to_str()
                    .unwrap()
                    .to_owned()
            })
            .collect()
    }

    #[test]
    fn argv_layout() {
        let settings = Settings {
            unwind: Unwind::Fast,
            demangle: false,
            interactive: Toggle::Off,
            color: Toggle::On,
            timeout: Duration::from_secs(45),
            preset: Preset::Medium,
            threads: Threads::All,
            registers: Registers::None,
            images: Images::Mentioned,
            limit: Some(100),
            top: 3,
            sanitize: Sanitize::Off,
            cache: false,
            output_to: OutputTo::Stderr,
            ..Default::default()
        };

        let mut args = BacktracerArgs::new();
        let argv = args.build(c"/opt/backtrace", &settings, 0x7f00_dead_beef);

        assert_eq!(argv.len(), ARGC + 1);
        assert!(argv[ARGC].is_null());

        let expected = [
            "/opt/backtrace",
            "--unwind",
            "fast",
            "--demangle",
            "false",
            "--interactive",
            "false",
            "--color",
            "true",
            "--timeout",
            "45",
            "--preset",
            "medium",
            "--crashinfo",
            "7f00deadbeef",
            "--threads",
            "all",
            "--registers",
            "none",
            "--images",
            "mentioned",
            "--limit",
            "100",
            "--top",
            "3",
            "--sanitize",
            "false",
            "--cache",
            "false",
            "--output-to",
            "stderr",
        ];
        assert_eq!(to_strings(argv), expected);
    }

    #[test]
    fn argv_unresolved() {
        let settings = Settings {
            limit: None,
            ..Default::default()
        };

        let mut args = BacktracerArgs::new();
        let argv = to_strings(args.build(c"bt", &settings, 0x1000));

        let value = |flag: &str| {
            let i = argv.iter().position(|a| a == flag).unwrap();
            argv[i + 1].clone()
        };

        assert_eq!(value("--preset"), "full");
        assert_eq!(value("--limit"), "none");
        assert_eq!(value("--interactive"), "false");
        assert_eq!(value("--crashinfo"), "1000");
        assert_eq!(value("--sanitize"), "preset");
        assert_eq!(value("--output-to"), "stdout");
    }

    #[test]
    fn launcher_needs_a_path() {
        let spawner = || Box::new(ExecSpawner::new(Path::new("/bin/true")).unwrap());

        assert!(matches!(
            Launcher::new(Settings::default(), spawner()),
            Err(Error::NoBacktracer)
        ));

        let settings = Settings {
            backtracer_path: Some(std::ffi::OsStr::from_bytes(b"bad\0path").into()),
            ..Default::default()
        };
        assert!(matches!(
            Launcher::new(settings, spawner()),
            Err(Error::InvalidPath)
        ));
    }

    #[test]
    fn child_environment() {
        let spawner = ExecSpawner::new(Path::new("/bin/sh")).unwrap();

        assert!(spawner.envp.last().unwrap().is_null());
        let env = to_strings(&spawner.envp);
        assert_eq!(
            env.iter()
                .filter(|e| e.starts_with("CRASH_BACKTRACE="))
                .collect::<Vec<_>>(),
            ["CRASH_BACKTRACE=enable=no"]
        );
    }

    /// The child must see the socket on fd 4 and its own settings, no matter
    /// which fd it was handed
    #[test]
    fn spawns_with_fd() {
        let mut fds = [-1; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) },
            0
        );

        let spawner = ExecSpawner::new(Path::new("/bin/sh")).unwrap();
        let argv = [
            c"sh".as_ptr(),
            c"-c".as_ptr(),
            c"echo \"$CRASH_BACKTRACE\" >&4".as_ptr(),
            ptr::null(),
        ];
        assert!(spawner.spawn(&argv, fds[1]));
        unsafe { libc::close(fds[1]) };

        let mut out = String::new();
        let mut read_end = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fds[0]) };
        std::io::Read::read_to_string(&mut read_end, &mut out).unwrap();
        assert_eq!(out, "enable=no\n");

        let missing = ExecSpawner::new(Path::new("/nonexistent/backtracer")).unwrap();
        assert!(!missing.spawn(&argv, 2));

        // Not nul terminated
        assert!(!spawner.spawn(&argv[..3], 2));
    }
}
