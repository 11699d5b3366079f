use basalt_transport::{ArrowError, ChunkError, IdError};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    #[error("already running: {0}")]
    AlreadyRunning(String),
    #[error("{0}")]
    Runtime(String),
    #[error("cancelled")]
    Cancelled,
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("invalid id: {0}")]
    Id(#[from] IdError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("client error: {0}")]
    Client(#[from] basalt_client::Error),
}

impl Error {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}
