//! `start` uses a static stack, so the modes are exercised one after the
//! other in a single test

use memserver::{Client, Mode};
use std::os::unix::{io::FromRawFd, net::UnixStream};

static MESSAGE: &[u8] = b"the quick brown fox jumps over the lazy dog";

fn read_through(mode: Mode) {
    let handle = unsafe { memserver::start(mode) }.expect("failed to start memory server");

    // The backtracer would normally inherit a duplicate of this
    let fd = unsafe { libc::dup(handle.fd()) };
    assert!(fd >= 0);
    let mut client = Client::new(unsafe { UnixStream::from_raw_fd(fd) });

    let read = client
        .read_vec(MESSAGE.as_ptr() as u64, MESSAGE.len())
        .unwrap();
    assert_eq!(read, MESSAGE);

    drop(client);
    // Closes our end and waits for the server to exit
    drop(handle);
}

#[test]
fn serves_from_clone() {
    read_through(Mode::Process);
    read_through(Mode::Thread);
}
