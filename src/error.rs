use thiserror::Error;

/// Runtime error kinds surfaced by the core.
///
/// Soft failures (out of memory, bad configuration, lifecycle misuse)
/// propagate through `Result`; invariant violations such as unlocking an
/// unheld mutex or freeing an uninitialized page are programming errors and
/// panic instead.
#[derive(Error, Debug)]
pub enum RtError {
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("timed out")]
    TimedOut,

    #[error("interrupted")]
    Interrupted,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("not registered")]
    NotRegistered,

    #[error("already stopped")]
    AlreadyStopped,

    #[error("wrong state: {0}")]
    WrongState(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RtError>;

impl RtError {
    /// Build an error from the calling thread's current `errno`.
    pub fn last_os_error() -> Self {
        RtError::Io(std::io::Error::last_os_error())
    }
}
