use crate::{
    BUFFER_SIZE, FaultTrapReader, ProcessVmReader, ReadMemory, Request, Response, reader,
};
use std::{
    io,
    os::unix::io::RawFd,
    ptr,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    time::{Duration, Instant},
};

/// Reads until `buf` is full, the peer closes the socket, or an error occurs.
///
/// Returns the number of bytes read, or a negated errno.
pub(crate) fn read_full(fd: RawFd, buf: &mut [u8]) -> isize {
    let mut total = 0;

    while total < buf.len() {
        // SAFETY: syscall, the range is within `buf`
        let ret = unsafe { libc::read(fd, buf[total..].as_mut_ptr().cast(), buf.len() - total) };

        match ret {
            0 => break,
            n if n > 0 => total += n as usize,
            _ => {
                let err = reader::errno();
                if err != libc::EINTR {
                    return -(err as isize);
                }
            }
        }
    }

    total as isize
}

/// Writes all of `buf`, returning the number of bytes written or a negated errno
pub(crate) fn write_full(fd: RawFd, buf: &[u8]) -> isize {
    let mut total = 0;

    while total < buf.len() {
        // SAFETY: syscall, the range is within `buf`
        let ret = unsafe { libc::write(fd, buf[total..].as_ptr().cast(), buf.len() - total) };

        if ret >= 0 {
            total += ret as usize;
        } else {
            let err = reader::errno();
            if err != libc::EINTR {
                return -(err as isize);
            }
        }
    }

    total as isize
}

/// The serving end of the protocol.
///
/// The server neither allocates nor takes locks, so it can run on a thread
/// or process that was started from a signal handler.
pub struct Server<'buf, R> {
    fd: RawFd,
    reader: R,
    buffer: &'buf mut [u8],
}

impl<'buf, R: ReadMemory> Server<'buf, R> {
    /// Creates a server on an already connected socket.
    ///
    /// Requests are answered in chunks no larger than `buffer`.
    #[inline]
    pub fn new(fd: RawFd, reader: R, buffer: &'buf mut [u8]) -> Self {
        Self { fd, reader, buffer }
    }

    /// Answers requests until the peer closes its end of the socket.
    ///
    /// Returns `false` if the loop ended because of an I/O error or a
    /// truncated request rather than a clean shutdown.
    pub fn run(&mut self) -> bool {
        loop {
            let mut req = [0u8; Request::SIZE];

            match read_full(self.fd, &mut req) {
                0 => return true,
                n if n == Request::SIZE as isize => {}
                _ => return false,
            }

            if !self.serve(Request::from_array(req)) {
                return false;
            }
        }
    }

    fn serve(&mut self, req: Request) -> bool {
        let mut addr = req.addr;
        let mut remaining = req.len;

        while remaining > 0 {
            let todo = remaining.min(self.buffer.len() as u64) as usize;
            let len = self
                .reader
                .read(&mut self.buffer[..todo], addr)
                .min(todo as isize);

            let resp = Response {
                addr,
                len: len as i64,
            };

            if write_full(self.fd, resp.as_bytes()) != Response::SIZE as isize {
                return false;
            }

            // The rest of the request is dropped, the client knows where we
            // stopped from the response address
            if len < 0 {
                crate::debug_print!("unreadable chunk");
                break;
            }

            if write_full(self.fd, &self.buffer[..len as usize]) != len {
                return false;
            }

            addr = addr.wrapping_add(len as u64);
            remaining -= len as u64;
        }

        true
    }
}

/// Runs a server on `fd` that reads the memory of `pid`.
///
/// The read strategy is picked once, up front: `process_vm_readv` if we have
/// `CAP_SYS_PTRACE`, otherwise a direct copy with `SIGSEGV` and `SIGBUS`
/// trapped, which only works if `pid`'s memory is mapped into this process,
/// or copied into it by `clone`.
pub fn serve(fd: RawFd, pid: libc::pid_t, buffer: &mut [u8]) -> bool {
    if reader::has_ptrace_capability() {
        Server::new(fd, ProcessVmReader::new(pid), buffer).run()
    } else {
        // SAFETY: only faults raised by our own reads are trapped, a fault on
        // any other thread still kills the process
        let reader = unsafe { FaultTrapReader::install() };
        Server::new(fd, reader, buffer).run()
    }
}

/// Where the server started by [`start`] runs
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// A thread that shares the address space, file table and signal
    /// handlers with the crashed process
    #[default]
    Thread,
    /// A child process holding a copy-on-write copy of the crashed process
    Process,
}

const STACK_SIZE: usize = 64 * 1024;

#[repr(C, align(16))]
struct Stack([u8; STACK_SIZE]);

static mut STACK: Stack = Stack([0; STACK_SIZE]);
static mut BUFFER: [u8; BUFFER_SIZE] = [0; BUFFER_SIZE];

static SERVER_FD: AtomicI32 = AtomicI32::new(-1);
static PEER_FD: AtomicI32 = AtomicI32::new(-1);
static TARGET_PID: AtomicI32 = AtomicI32::new(0);
static IN_PROCESS: AtomicBool = AtomicBool::new(false);
/// 1 while a server thread is running, it can't be waited for with `waitpid`
static THREAD_RUNNING: AtomicU32 = AtomicU32::new(0);

/// How long dropping a [`Handle`] waits for a server thread to exit
const THREAD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Defined ourselves as it is missing from libc for Android
const PR_SET_PTRACER: libc::c_int = 0x59616d61;

extern "C" fn entry(_arg: *mut libc::c_void) -> libc::c_int {
    let fd = SERVER_FD.load(Ordering::Acquire);
    let pid = TARGET_PID.load(Ordering::Acquire);

    // SAFETY: syscalls, and only one server runs at a time so the buffer is
    // ours alone
    unsafe {
        if IN_PROCESS.load(Ordering::Acquire) {
            libc::prctl(libc::PR_SET_NAME, c"[backtrace]".as_ptr());
            // Otherwise we would keep our own peer alive and never see EOF
            libc::close(PEER_FD.load(Ordering::Acquire));
        }

        let clean = serve(fd, pid, &mut *(&raw mut BUFFER));
        libc::close(fd);

        if !IN_PROCESS.load(Ordering::Acquire) {
            THREAD_RUNNING.store(0, Ordering::Release);
            libc::syscall(
                libc::SYS_futex,
                THREAD_RUNNING.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1,
            );
        }

        if clean { 0 } else { 1 }
    }
}

/// Starts a memory server for the current process.
///
/// Returns a [`Handle`] holding the client end of the socket, which is meant
/// to be handed to the backtracer.
///
/// # Safety
///
/// This is async signal safe, but uses a static stack and buffer, so only one
/// server may run at a time. In [`Mode::Thread`] the server installs process
/// wide `SIGSEGV` and `SIGBUS` handlers while it runs.
pub unsafe fn start(mode: Mode) -> io::Result<Handle> {
    unsafe {
        let mut fds = [-1; 2];
        if libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        SERVER_FD.store(fds[0], Ordering::Release);
        PEER_FD.store(fds[1], Ordering::Release);
        TARGET_PID.store(libc::getpid(), Ordering::Release);
        IN_PROCESS.store(mode == Mode::Process, Ordering::Release);
        THREAD_RUNNING.store((mode == Mode::Thread).into(), Ordering::Release);

        let flags = match mode {
            Mode::Thread => {
                libc::CLONE_THREAD
                    | libc::CLONE_VM
                    | libc::CLONE_FILES
                    | libc::CLONE_FS
                    | libc::CLONE_IO
                    | libc::CLONE_SIGHAND
            }
            Mode::Process => 0,
        };

        let stack_top = (&raw mut STACK).cast::<u8>().add(STACK_SIZE);
        let ret = libc::clone(entry, stack_top.cast(), flags, ptr::null_mut());

        if ret < 0 {
            let err = io::Error::last_os_error();
            THREAD_RUNNING.store(0, Ordering::Release);
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err);
        }

        let child = match mode {
            Mode::Thread => None,
            Mode::Process => {
                // Tell Yama, if it is enabled, that the server may read us
                libc::prctl(PR_SET_PTRACER, ret as libc::c_ulong);
                libc::close(fds[0]);
                Some(ret)
            }
        };

        Ok(Handle { fd: fds[1], child })
    }
}

/// The client side of a server started by [`start`].
///
/// Dropping the handle closes the client end of the socket, which ends the
/// server loop once every other copy of it (eg. the backtracer's) is closed,
/// and then waits for the server to exit, reaping it in [`Mode::Process`].
pub struct Handle {
    fd: RawFd,
    child: Option<libc::pid_t>,
}

impl Handle {
    /// The client end of the socket
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // SAFETY: syscalls
        unsafe {
            libc::close(self.fd);

            if let Some(pid) = self.child {
                let mut status = 0;
                while libc::waitpid(pid, &mut status, libc::__WALL) < 0
                    && reader::errno() == libc::EINTR
                {}
            } else {
                wait_for_thread_exit(THREAD_EXIT_TIMEOUT);
            }
        }
    }
}

/// Waits until the server thread has restored its fault handlers and is
/// about to exit
fn wait_for_thread_exit(timeout: Duration) {
    let deadline = Instant::now() + timeout;

    while THREAD_RUNNING.load(Ordering::Acquire) != 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            crate::debug_print!("server thread did not exit");
            return;
        }

        let ts = libc::timespec {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_nsec: remaining.subsec_nanos() as libc::c_long,
        };

        // SAFETY: syscall
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                THREAD_RUNNING.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                1,
                &ts as *const libc::timespec,
            );
        }
    }
}
