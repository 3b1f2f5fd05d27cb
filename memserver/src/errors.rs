#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("memory at {addr:#x} is unreadable (errno {errno})")]
    Unreadable { addr: u64, errno: i32 },
    #[error("protocol error, expected a response for {expected:#x} but received one for {received:#x}")]
    Protocol { expected: u64, received: u64 },
    #[error("response of {len} bytes overruns the {remaining} bytes that were requested")]
    Overrun { len: i64, remaining: u64 },
}
