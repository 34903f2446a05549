//! Single-flight token refresh
//!
//! At most one refresh exchange runs per coordinator. The first 401 creates a
//! shared, memoized future for the attempt and parks it in a private slot;
//! every 401 that arrives before it settles clones that same future instead of
//! starting another exchange, so all of them observe one outcome.
//!
//! States:
//! - Idle → Refreshing (refresh requested, slot empty: start attempt N+1)
//! - Refreshing → Refreshing (refresh requested, slot full: join attempt N)
//! - Refreshing → Idle (attempt settles, success or failure)
//!
//! The attempt runs as a spawned task, so it settles even when the request
//! that started it is cancelled. It saves the new pair on success or clears
//! the store on failure (unless a different pair was saved meanwhile), then
//! empties the slot before handing its outcome to the waiters.
//! The check-and-create step holds a mutex because tokio may poll callers on
//! different worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use session_auth::{CredentialPair, CredentialStore, RefreshExchange};
use tracing::{debug, info, warn};

/// A refresh attempt that did not produce a new pair.
///
/// `attempt` identifies which exchange failed so the session is invalidated
/// once per attempt regardless of how many requests joined it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("refresh attempt {attempt} failed: {error}")]
pub struct RefreshFailure {
    pub attempt: u64,
    pub error: session_auth::Error,
}

/// Outcome shared by every caller joined to one attempt.
pub type RefreshOutcome = std::result::Result<CredentialPair, RefreshFailure>;

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing { attempt: u64 },
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    attempt: u64,
    future: SharedRefresh,
}

type Slot = Arc<Mutex<Option<InFlight>>>;

/// Coalesces concurrent refresh requests into one exchange.
pub struct RefreshCoordinator {
    exchange: Arc<dyn RefreshExchange>,
    store: Arc<dyn CredentialStore>,
    slot: Slot,
    attempts: AtomicU64,
    refresh_timeout: Option<Duration>,
}

impl RefreshCoordinator {
    /// Coordinator with no bound on how long an exchange may take.
    pub fn new(exchange: Arc<dyn RefreshExchange>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            exchange,
            store,
            slot: Arc::new(Mutex::new(None)),
            attempts: AtomicU64::new(0),
            refresh_timeout: None,
        }
    }

    /// Fail an attempt with `Error::Timeout` once it has run for `timeout`.
    ///
    /// Without this an exchange that never answers keeps the coordinator in
    /// `Refreshing`, and every request that joins it waits with it.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> RefreshState {
        match lock(&self.slot).as_ref() {
            Some(in_flight) => RefreshState::Refreshing {
                attempt: in_flight.attempt,
            },
            None => RefreshState::Idle,
        }
    }

    /// Number of exchanges started over the coordinator's lifetime.
    pub fn attempts_started(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Join the in-flight refresh, or start one exchanging `pair`.
    ///
    /// `pair` is only used when this call starts the attempt; joiners get the
    /// outcome of whatever pair the starter sent.
    pub async fn get_or_start_refresh(&self, pair: &CredentialPair) -> RefreshOutcome {
        self.join_or_start(pair).await
    }

    fn join_or_start(&self, pair: &CredentialPair) -> SharedRefresh {
        let mut slot = lock(&self.slot);
        if let Some(in_flight) = slot.as_ref() {
            debug!(attempt = in_flight.attempt, "joining in-flight token refresh");
            return in_flight.future.clone();
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let task = tokio::spawn(run_attempt(
            attempt,
            pair.clone(),
            self.exchange.clone(),
            self.store.clone(),
            self.slot.clone(),
            self.refresh_timeout,
        ));
        let task_slot = self.slot.clone();
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(attempt, error = %e, "token refresh task did not complete");
                    release_slot(&task_slot, attempt);
                    Err(RefreshFailure {
                        attempt,
                        error: session_auth::Error::TokenExchange(format!(
                            "refresh task failed: {e}"
                        )),
                    })
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            attempt,
            future: future.clone(),
        });
        info!(attempt, "starting token refresh");
        future
    }
}

/// One refresh exchange, from request to settlement.
///
/// Runs as its own task so the outcome is persisted even if every caller
/// waiting on it has gone away.
async fn run_attempt(
    attempt: u64,
    pair: CredentialPair,
    exchange: Arc<dyn RefreshExchange>,
    store: Arc<dyn CredentialStore>,
    slot: Slot,
    refresh_timeout: Option<Duration>,
) -> RefreshOutcome {
    let result = match refresh_timeout {
        Some(limit) => tokio::time::timeout(limit, exchange.refresh(&pair))
            .await
            .unwrap_or(Err(session_auth::Error::Timeout(limit))),
        None => exchange.refresh(&pair).await,
    };

    match &result {
        Ok(new_pair) => {
            if let Err(e) = store.save(new_pair).await {
                warn!(attempt, error = %e, "failed to persist refreshed credentials");
            }
            metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
            info!(attempt, "token refresh succeeded");
        }
        Err(e) => {
            metrics::counter!("session_refresh_total", "outcome" => "failure").increment(1);
            // A login that landed while the exchange ran is not ours to clear
            let replaced = store
                .get()
                .is_some_and(|current| current.refresh_token != pair.refresh_token);
            if replaced {
                info!(attempt, error = %e, "token refresh failed, keeping newer credentials");
            } else {
                warn!(attempt, error = %e, "token refresh failed, clearing credentials");
                if let Err(clear_err) = store.clear().await {
                    warn!(attempt, error = %clear_err, "failed to clear credentials");
                }
            }
        }
    }

    release_slot(&slot, attempt);
    result.map_err(|error| RefreshFailure { attempt, error })
}

/// Empty the slot if it still holds `attempt`.
fn release_slot(slot: &Mutex<Option<InFlight>>, attempt: u64) {
    let mut slot = lock(slot);
    if slot.as_ref().is_some_and(|f| f.attempt == attempt) {
        *slot = None;
    }
}

fn lock(slot: &Mutex<Option<InFlight>>) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
