//! Error types for relying-party operations

/// Errors from OIDC flows.
///
/// None of these are retried internally. `ReplayRejected` covers a missing,
/// tombstoned or session-mismatched state bundle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Protocol(String),

    #[error("token validation failed: {0}")]
    TokenValidation(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unable to find a key for {0}")]
    KeyNotFound(String),

    #[error("unable to determine state: {0}")]
    ReplayRejected(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// True for every failure of token shape, signature or claims.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Error::TokenValidation(_)
                | Error::MalformedToken(_)
                | Error::UnsupportedAlgorithm(_)
                | Error::KeyNotFound(_)
        )
    }

    /// Short stable label, used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Discovery(_) => "discovery",
            Error::Transport(_) => "transport",
            Error::Protocol(_) => "protocol",
            Error::TokenValidation(_) => "token_validation",
            Error::MalformedToken(_) => "malformed_token",
            Error::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Error::KeyNotFound(_) => "key_not_found",
            Error::ReplayRejected(_) => "replay_rejected",
            Error::Storage(_) => "storage",
        }
    }
}

impl From<token_storage::StorageError> for Error {
    fn from(e: token_storage::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result alias for relying-party operations.
pub type Result<T> = std::result::Result<T, Error>;
