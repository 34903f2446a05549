//! Error types for the request pipeline

/// Errors surfaced to callers of the interceptor.
///
/// HTTP error statuses are not errors here: a 404 or 500 from upstream is a
/// `TransportResponse` and passes through untouched. Only failures to get a
/// response at all, and a failed session refresh, become `Err`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The refresh exchange failed; every request that joined it gets this.
    #[error("session refresh failed: {0}")]
    Refresh(#[from] session_auth::Error),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
