use thiserror::Error;

/// Errors surfaced by the messaging fabric.
///
/// Per-recipient delivery failures are absorbed (the send succeeded once
/// persistence succeeded), so this surface is small.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The optimizer was asked to queue for a user that was never
    /// registered.
    #[error("unknown user: {0}")]
    UnknownUser(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;
