use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The referenced session or turn does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation failed on write (bad metadata, duplicate participants,
    /// attempt to mutate an immutable field).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend unreachable. `degraded` is true while the in-memory
    /// fallback is serving.
    #[error("storage unavailable: {detail}")]
    Unavailable { detail: String, degraded: bool },

    #[error("internal storage error: {0}")]
    Internal(String),
}

impl From<StorageError> for chorus_core::ChorusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => chorus_core::ChorusError::NotFound(what),
            StorageError::InvalidInput(msg) => chorus_core::ChorusError::InvalidInput(msg),
            StorageError::Unavailable { detail, degraded } => {
                chorus_core::ChorusError::StorageUnavailable { detail, degraded }
            }
            other => chorus_core::ChorusError::StorageUnavailable {
                detail: other.to_string(),
                degraded: false,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
