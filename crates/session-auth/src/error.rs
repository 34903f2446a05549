//! Error types for credential storage and token refresh

use std::time::Duration;

/// Errors from credential storage and refresh exchange operations.
///
/// Payloads are strings so a single refresh outcome can be cloned out to
/// every caller that joined the attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),

    #[error("refresh unsuccessful: {0}")]
    Rejected(String),

    #[error("token refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential and refresh operations.
pub type Result<T> = std::result::Result<T, Error>;
