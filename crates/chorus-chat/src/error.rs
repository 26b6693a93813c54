use thiserror::Error;

use chorus_storage::StorageError;

/// Errors surfaced by the chat manager.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Referenced session or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The actor is not a participant of the target session.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Self-private-chat, empty member list, malformed input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ChatError> for chorus_core::ChorusError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound(what) => chorus_core::ChorusError::NotFound(what),
            ChatError::Forbidden(msg) => chorus_core::ChorusError::Forbidden(msg),
            ChatError::InvalidInput(msg) => chorus_core::ChorusError::InvalidInput(msg),
            ChatError::Storage(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
