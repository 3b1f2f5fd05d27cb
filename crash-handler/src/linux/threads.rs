use std::io;

/// Enumerates the threads of the current process.
///
/// This is the only part of thread suspension that differs between platforms
/// and environments, everything else is plain signals and futexes.
pub trait ThreadSource {
    /// Calls `f` once with the id of every thread in the process.
    ///
    /// This is called from a signal handler, so implementations must be
    /// async signal safe, and must not allocate.
    fn for_each_thread(&mut self, f: &mut dyn FnMut(libc::pid_t)) -> io::Result<()>;
}

/// Lists `/proc/self/task` with `getdents64`.
///
/// `opendir` and friends allocate, so we read the raw directory entries into
/// a stack buffer instead.
#[derive(Copy, Clone, Default)]
pub struct ProcTaskDir;

#[repr(C, align(8))]
struct DirentBuf([u8; 4096]);

/// `struct linux_dirent64`, after `d_ino` and `d_off`
const RECLEN_OFFSET: usize = 16;
const NAME_OFFSET: usize = 19;

impl ThreadSource for ProcTaskDir {
    fn for_each_thread(&mut self, f: &mut dyn FnMut(libc::pid_t)) -> io::Result<()> {
        // SAFETY: syscalls, the kernel writes no more than the buffer length
        unsafe {
            let fd = libc::open(
                c"/proc/self/task".as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            );
            if fd < 0 {
                return Err(io::Error::from_raw_os_error(errno::errno().0));
            }

            let mut buf = DirentBuf([0; 4096]);
            let result = loop {
                let read = libc::syscall(
                    libc::SYS_getdents64,
                    fd,
                    buf.0.as_mut_ptr(),
                    buf.0.len(),
                );

                if read < 0 {
                    let err = errno::errno().0;
                    if err == libc::EINTR {
                        continue;
                    }
                    break Err(io::Error::from_raw_os_error(err));
                } else if read == 0 {
                    break Ok(());
                }

                for_each_entry(&buf.0[..read as usize], f);
            };

            libc::close(fd);
            result
        }
    }
}

fn for_each_entry(entries: &[u8], f: &mut dyn FnMut(libc::pid_t)) {
    let mut offset = 0;

    while offset + NAME_OFFSET < entries.len() {
        let reclen = u16::from_ne_bytes([
            entries[offset + RECLEN_OFFSET],
            entries[offset + RECLEN_OFFSET + 1],
        ]) as usize;

        if reclen == 0 || offset + reclen > entries.len() {
            break;
        }

        if let Some(tid) = parse_tid(&entries[offset + NAME_OFFSET..offset + reclen]) {
            f(tid);
        }

        offset += reclen;
    }
}

/// Parses a nul terminated decimal thread id, `.` and `..` are rejected
fn parse_tid(name: &[u8]) -> Option<libc::pid_t> {
    let mut tid: libc::pid_t = 0;
    let mut digits = 0;

    for &c in name.iter().take_while(|c| **c != 0) {
        if !c.is_ascii_digit() {
            return None;
        }
        tid = tid.checked_mul(10)?.checked_add((c - b'0') as libc::pid_t)?;
        digits += 1;
    }

    (digits > 0).then_some(tid)
}

/// The kernel id of the calling thread
#[inline]
pub fn gettid() -> libc::pid_t {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Sends `sig` to a single thread, returning false if it could not be
/// delivered, eg. the thread has already exited
#[inline]
pub(crate) fn tgkill(pid: libc::pid_t, tid: libc::pid_t, sig: libc::c_int) -> bool {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, sig) == 0 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tids() {
        assert_eq!(parse_tid(b"1234\0\0\0"), Some(1234));
        assert_eq!(parse_tid(b"7"), Some(7));
        assert_eq!(parse_tid(b".\0"), None);
        assert_eq!(parse_tid(b"..\0"), None);
        assert_eq!(parse_tid(b"\0"), None);
        assert_eq!(parse_tid(b"12a\0"), None);
        assert_eq!(parse_tid(b"99999999999\0"), None);
    }

    #[test]
    fn lists_our_threads() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let worker = std::thread::spawn(move || {
            tx.send(gettid()).unwrap();
            let _ = done_rx.recv();
        });
        let worker_tid = rx.recv().unwrap();

        let mut tids = Vec::new();
        ProcTaskDir
            .for_each_thread(&mut |tid| tids.push(tid))
            .unwrap();

        assert!(tids.contains(&gettid()));
        assert!(tids.contains(&worker_tid));
        assert!(tids.contains(&(std::process::id() as libc::pid_t)));

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
