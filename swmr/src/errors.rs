use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwmrError>;

#[derive(Debug, Error)]
pub enum SwmrError {
    /// The storage object could not be created, truncated or opened in the required mode.
    #[error("cannot initialise storage at {}: {reason}", path.display())]
    StorageInit { path: PathBuf, reason: String },

    /// A named object or attribute was requested after concurrent-read mode started.
    #[error("cannot create `{0}`: concurrent-read mode is enabled")]
    ConcurrentMode(String),

    #[error("no signal received within {0:?}")]
    TimeoutExpired(Duration),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Storage(#[from] hdf5::Error),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync hands back `Box<dyn Error>` which is neither Send nor Sync.
    #[error("event error: {0}")]
    Event(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("logic error: {0}")]
    Logic(String),
}

impl SwmrError {
    pub(crate) fn event(err: Box<dyn std::error::Error>) -> Self {
        SwmrError::Event(err.to_string())
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        SwmrError::Logic(msg.into())
    }
}

impl From<confy::ConfyError> for SwmrError {
    fn from(err: confy::ConfyError) -> Self {
        SwmrError::Config(err.to_string())
    }
}
