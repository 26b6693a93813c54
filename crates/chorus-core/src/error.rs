use thiserror::Error;

/// Platform-level error taxonomy surfaced at the API boundary.
///
/// Subsystem crates define their own error enums and convert into this at
/// the gateway; `code()` is the short string sent to clients.
#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Backend unreachable after retries. `degraded` is true while the
    /// in-memory fallback store is serving requests.
    #[error("storage unavailable: {detail}")]
    StorageUnavailable { detail: String, degraded: bool },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChorusError {
    /// Short error code string sent to clients in failure responses.
    pub fn code(&self) -> &'static str {
        match self {
            ChorusError::NotFound(_) => "NOT_FOUND",
            ChorusError::Forbidden(_) => "FORBIDDEN",
            ChorusError::InvalidInput(_) => "INVALID_INPUT",
            ChorusError::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            ChorusError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ChorusError::RateLimited(_) => "RATE_LIMITED",
            ChorusError::Cancelled => "CANCELLED",
            ChorusError::Config(_) => "CONFIG_ERROR",
            ChorusError::Serialization(_) => "SERIALIZATION_ERROR",
            ChorusError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChorusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChorusError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(ChorusError::Forbidden("x".into()).code(), "FORBIDDEN");
        assert_eq!(
            ChorusError::StorageUnavailable {
                detail: "down".into(),
                degraded: true
            }
            .code(),
            "STORAGE_UNAVAILABLE"
        );
        assert_eq!(ChorusError::Cancelled.code(), "CANCELLED");
    }
}
