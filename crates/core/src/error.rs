/// Errors that can occur while supervising processes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("process already exists: {0}")]
    DuplicateProcess(String),

    #[error("unknown container: {0}")]
    UnknownContainer(String),

    #[error("container already exists: {0}")]
    DuplicateContainer(String),

    #[error("invalid handle: {0:?}")]
    InvalidHandle(String),

    #[error("property does not exist: {0}")]
    UndefinedProperty(String),

    #[error("executable not found: {0}")]
    UnknownExecutable(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("write after close")]
    WriteAfterClose,

    #[error("closed twice")]
    DoubleClose,

    #[error("sink already set")]
    SinkAlreadySet,

    #[error("process exited abnormally: {0}")]
    Exited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the multiplexer guard errors that callers are expected
    /// to tolerate when a legitimate EOF races a late attach.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::WriteAfterClose | Error::DoubleClose)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
