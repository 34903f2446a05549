//! Request interceptor
//!
//! Every authenticated API call goes through `RequestInterceptor::execute`.
//! A 401 is recovered locally only when all of these hold:
//! - a credential pair was attached to the request
//! - the request is not the refresh endpoint itself (no nested refresh)
//!
//! Recovery is one refresh (shared with concurrent 401s) and one replay of the
//! original request. Any other outcome reaches the caller unchanged.

use std::sync::Arc;

use reqwest::StatusCode;
use session_auth::CredentialStore;
use tracing::{debug, instrument};

use crate::coordinator::RefreshCoordinator;
use crate::error::{Error, Result};
use crate::session::SessionInvalidator;
use crate::transport::{PendingRequest, Transport, TransportResponse};

/// Recognizes requests aimed at the refresh endpoint.
///
/// An absolute endpoint matches on origin and path; a relative one matches any
/// origin on path alone. Query strings and a trailing slash are ignored, and
/// paths compare case-insensitively.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    origin: Option<String>,
    path: String,
}

impl RefreshEndpoint {
    pub fn parse(endpoint: &str) -> Self {
        match reqwest::Url::parse(endpoint) {
            Ok(url) => Self {
                origin: Some(url.origin().ascii_serialization()),
                path: normalize_path(url.path()),
            },
            Err(_) => Self {
                origin: None,
                path: normalize_path(endpoint.split(['?', '#']).next().unwrap_or_default()),
            },
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        let Ok(url) = reqwest::Url::parse(target) else {
            let path = target.split(['?', '#']).next().unwrap_or_default();
            return normalize_path(path).eq_ignore_ascii_case(&self.path);
        };
        let same_origin = match &self.origin {
            Some(origin) => url.origin().ascii_serialization() == *origin,
            None => true,
        };
        same_origin && normalize_path(url.path()).eq_ignore_ascii_case(&self.path)
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else {
        trimmed.to_string()
    }
}

/// Attaches credentials and recovers from expired access tokens.
pub struct RequestInterceptor {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    invalidator: Arc<SessionInvalidator>,
    refresh_endpoint: RefreshEndpoint,
}

impl RequestInterceptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
        invalidator: Arc<SessionInvalidator>,
        refresh_endpoint: RefreshEndpoint,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
            invalidator,
            refresh_endpoint,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send `request` with the session's credentials.
    ///
    /// Upstream error statuses come back as `Ok` responses. `Err` means no
    /// response was obtained, or the refresh triggered by a 401 failed; in
    /// that case the error is the refresh error, not the 401.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn execute(&self, request: PendingRequest) -> Result<TransportResponse> {
        // Exactly one credential read per request
        let Some(pair) = self.store.get() else {
            return self.transport.send(request).await;
        };

        let response = self.transport.send(request.with_bearer(&pair)?).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if self.refresh_endpoint.matches(&request.url) {
            debug!("401 from the refresh endpoint, not refreshing");
            return Ok(response);
        }

        debug!("access token rejected, refreshing");
        match self.coordinator.get_or_start_refresh(&pair).await {
            Ok(new_pair) => {
                debug!("replaying request with refreshed token");
                self.transport.send(request.with_bearer(&new_pair)?).await
            }
            Err(failure) => {
                // The attempt leaves the store populated only when a new
                // login replaced the pair it was refreshing
                if self.store.get().is_some() {
                    debug!(attempt = failure.attempt, "session replaced during refresh, not logging out");
                } else {
                    self.invalidator.invalidate_attempt(failure.attempt).await;
                }
                Err(Error::Refresh(failure.error))
            }
        }
    }
}
