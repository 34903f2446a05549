//! Session invalidation
//!
//! When a refresh fails for good the session is over: credentials are cleared
//! and the user is sent to the login surface. Navigation itself belongs to
//! whoever embeds the pipeline and is injected through `Navigator`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use session_auth::CredentialStore;
use tracing::{debug, info, warn};

/// Navigation collaborator, e.g. a router or a redirect sink.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Clears credentials and navigates to login.
pub struct SessionInvalidator {
    store: Arc<dyn CredentialStore>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
    last_invalidated_attempt: AtomicU64,
}

impl SessionInvalidator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        login_route: impl Into<String>,
    ) -> Self {
        Self {
            store,
            navigator,
            login_route: login_route.into(),
            last_invalidated_attempt: AtomicU64::new(0),
        }
    }

    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    /// End the session. Safe to call any number of times.
    ///
    /// A failing clear is logged; navigation happens regardless.
    pub async fn invalidate(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credentials during invalidation");
        }
        metrics::counter!("session_invalidations_total").increment(1);
        info!(route = %self.login_route, "session invalidated, navigating to login");
        self.navigator.navigate(&self.login_route);
    }

    /// End the session for a failed refresh attempt.
    ///
    /// Every request joined to the attempt calls this; only the first call
    /// per attempt (or for any later attempt) navigates.
    pub async fn invalidate_attempt(&self, attempt: u64) {
        let previous = self
            .last_invalidated_attempt
            .fetch_max(attempt, Ordering::AcqRel);
        if previous >= attempt {
            debug!(attempt, "session already invalidated for this refresh attempt");
            return;
        }
        self.invalidate().await;
    }
}
