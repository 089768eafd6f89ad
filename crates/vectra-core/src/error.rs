use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine-wide error taxonomy. The HTTP layer maps these onto status codes;
/// nothing below it panics on user input.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The collection exists on disk but is still being loaded. Callers
    /// should retry.
    #[error("collection [{0}] is loading")]
    Loading(String),

    #[error("no searchable index")]
    IndexUnavailable,

    #[error("search deadline exceeded")]
    Timeout,

    #[error("segment is already training")]
    AlreadyTraining,

    #[error("not enough memory to train: required {required} bytes, available {available} bytes")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("segment has no index handle")]
    IndexMissing,

    #[error("vector id overflow: doc_id {doc_id}, tag {tag}")]
    VidOverflow { doc_id: u64, tag: u64 },

    // Index engine failure states.
    #[error("index not initialized")]
    IndexNotInitialized,

    #[error("train failed: dataset is empty")]
    DatasetEmpty,

    #[error("train failed: dataset size equals index size")]
    NothingToTrain,

    #[error("index not ready for search")]
    IndexNotReady,

    #[error("corrupt index data: {0}")]
    Corrupt(String),

    #[error("trainer exited with status {0}")]
    TrainFailed(i32),

    /// A pool worker went away before delivering its result.
    #[error("task canceled: {0}")]
    Canceled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serde(err.to_string())
    }
}
