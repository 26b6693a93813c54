use thiserror::Error;

use chorus_storage::StorageError;

/// Errors surfaced by the dialogue manager.
///
/// LLM failures are NOT errors here — they produce fallback response
/// objects so the dialogue history stays well-formed.
#[derive(Debug, Error)]
pub enum DialogueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The request was cancelled cooperatively. The user turn may already
    /// be persisted; nothing was delivered.
    #[error("cancelled")]
    Cancelled,
}

impl From<DialogueError> for chorus_core::ChorusError {
    fn from(err: DialogueError) -> Self {
        match err {
            DialogueError::Storage(e) => e.into(),
            DialogueError::Cancelled => chorus_core::ChorusError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, DialogueError>;
