/// An error that can occur when attaching a [`crate::CrashHandler`] or parsing
/// its [`crate::Settings`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unable to `mmap` memory for the alternate signal stack
    #[error("unable to allocate memory")]
    OutOfMemory,
    /// For simplicity sake, only one [`crate::CrashHandler`] can be registered
    /// at any one time.
    #[error("a crash handler is already installed")]
    HandlerAlreadyInstalled,
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A setting had a value that could not be parsed
    #[error("invalid value '{value}' for setting '{key}'")]
    InvalidSetting { key: String, value: String },
    /// A setting that we know nothing about
    #[error("unknown setting '{0}'")]
    UnknownSetting(String),
    /// The backtracer path contained a nul byte
    #[error("the backtracer path contains a nul byte")]
    InvalidPath,
    /// Backtracing is enabled, but there is nothing to run
    #[error("no backtracer path was configured")]
    NoBacktracer,
}
