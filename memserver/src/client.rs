use crate::{Error, Request, Response};
use std::{
    io::{Read, Write},
    os::unix::{
        io::{FromRawFd, RawFd},
        net::UnixStream,
    },
};

/// Reads memory from a crashed process through its memory server.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Creates a client on a socket connected to a memory server
    #[inline]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Sends a request for `len` bytes starting at `addr`.
    ///
    /// The server will answer with one or more chunks which must be received
    /// with [`Self::recv_response`] and [`Self::recv_payload`] before
    /// another request is sent.
    pub fn send_request(&mut self, addr: u64, len: u64) -> Result<(), Error> {
        let req = Request { addr, len };
        self.stream.write_all(req.as_bytes())?;
        Ok(())
    }

    /// Receives the header of the next chunk
    pub fn recv_response(&mut self) -> Result<Response, Error> {
        let mut buf = [0u8; Response::SIZE];
        self.stream.read_exact(&mut buf)?;
        Ok(Response::from_array(buf))
    }

    /// Receives the payload of a chunk whose header reported `buf.len()`
    /// bytes
    pub fn recv_payload(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] with the address of the first byte that could
    /// not be read if any part of the range is unreadable. The bytes before
    /// that address have been copied into `buf`.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }

        self.send_request(addr, buf.len() as u64)?;

        let mut offset = 0;
        while offset < buf.len() {
            let expected = addr.wrapping_add(offset as u64);
            let resp = self.recv_response()?;

            if resp.addr != expected {
                return Err(Error::Protocol {
                    expected,
                    received: resp.addr,
                });
            }

            if resp.len < 0 {
                log::debug!("{expected:#x} is unreadable: errno {}", -resp.len);
                return Err(Error::Unreadable {
                    addr: expected,
                    errno: -resp.len as i32,
                });
            }

            let remaining = buf.len() - offset;
            if resp.len == 0 || resp.len as u64 > remaining as u64 {
                return Err(Error::Overrun {
                    len: resp.len,
                    remaining: remaining as u64,
                });
            }

            let len = resp.len as usize;
            self.recv_payload(&mut buf[offset..offset + len])?;
            offset += len;
        }

        Ok(())
    }

    /// Reads `len` bytes starting at `addr` into a new buffer
    pub fn read_vec(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

impl FromRawFd for Client {
    /// Takes ownership of a socket inherited from the crashed process
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::new(unsafe { UnixStream::from_raw_fd(fd) })
    }
}
