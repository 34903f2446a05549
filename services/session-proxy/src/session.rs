//! Session management endpoints
//!
//! `GET /session` reports whether a credential pair is stored, `PUT /session`
//! installs a pair obtained from a login flow, and `DELETE /session` logs out
//! through the same invalidation path a failed refresh takes.

use auth_pipeline::{Navigator, SessionInvalidator};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use session_auth::{CredentialPair, CredentialStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::proxy::error_response;

/// Navigator for a headless process: there is no page to leave, so the
/// login redirect is recorded and surfaced through `/session` and `/health`.
#[derive(Debug, Default)]
pub struct SessionNavigator {
    last_route: RwLock<Option<String>>,
    logouts: AtomicU64,
}

impl SessionNavigator {
    /// Route of the most recent logout, cleared when a new session is installed.
    pub fn last_route(&self) -> Option<String> {
        self.last_route
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn logouts(&self) -> u64 {
        self.logouts.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        *self.last_route.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Navigator for SessionNavigator {
    fn navigate(&self, route: &str) {
        self.logouts.fetch_add(1, Ordering::Relaxed);
        *self.last_route.write().unwrap_or_else(|e| e.into_inner()) = Some(route.to_string());
        info!(route, "login required");
    }
}

/// Shared state for the session handlers
#[derive(Clone)]
pub struct SessionState {
    pub store: Arc<dyn CredentialStore>,
    pub invalidator: Arc<SessionInvalidator>,
    pub navigator: Arc<SessionNavigator>,
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// `GET /session`
pub fn status(state: &SessionState) -> Response {
    let authenticated = state.store.get().is_some();
    let mut body = serde_json::json!({ "authenticated": authenticated });
    if !authenticated {
        if let Some(route) = state.navigator.last_route() {
            body["login_route"] = serde_json::Value::String(route);
        }
    }
    json(StatusCode::OK, body)
}

/// `PUT /session`: body is `{"token": ..., "refreshToken": ..., ...profile}`.
pub async fn login(state: &SessionState, body: &[u8], request_id: &str) -> Response {
    let pair: CredentialPair = match serde_json::from_slice(body) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "rejected session payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid credential pair: {e}"),
                request_id,
            );
        }
    };
    if pair.access_token.expose().is_empty() || pair.refresh_token.expose().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "token and refreshToken must not be empty",
            request_id,
        );
    }

    if let Err(e) = state.store.save(&pair).await {
        error!(error = %e, "failed to persist session");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            &e.to_string(),
            request_id,
        );
    }
    state.navigator.reset();
    info!("session installed");
    StatusCode::NO_CONTENT.into_response()
}

/// `DELETE /session`
pub async fn logout(state: &SessionState) -> Response {
    state.invalidator.invalidate().await;
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_auth::MemoryCredentialStore;

    fn state(stored: Option<CredentialPair>) -> (SessionState, Arc<MemoryCredentialStore>) {
        let store = Arc::new(match stored {
            Some(pair) => MemoryCredentialStore::with_pair(pair),
            None => MemoryCredentialStore::new(),
        });
        let navigator = Arc::new(SessionNavigator::default());
        let invalidator = Arc::new(SessionInvalidator::new(
            store.clone(),
            navigator.clone(),
            "/login",
        ));
        (
            SessionState {
                store: store.clone(),
                invalidator,
                navigator,
            },
            store,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn navigator_records_route() {
        let navigator = SessionNavigator::default();
        assert_eq!(navigator.last_route(), None);

        navigator.navigate("/login");
        navigator.navigate("/login");
        assert_eq!(navigator.last_route().as_deref(), Some("/login"));
        assert_eq!(navigator.logouts(), 2);

        navigator.reset();
        assert_eq!(navigator.last_route(), None);
    }

    #[tokio::test]
    async fn login_stores_pair_with_profile() {
        let (state, store) = state(None);
        let response = login(
            &state,
            br#"{"token":"A1","refreshToken":"B1","userName":"ada"}"#,
            "req_1",
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let pair = store.get().unwrap();
        assert_eq!(pair.access_token.expose(), "A1");
        assert_eq!(pair.refresh_token.expose(), "B1");
        assert_eq!(pair.profile["userName"], "ada");
    }

    #[tokio::test]
    async fn login_rejects_partial_pair() {
        let (state, store) = state(None);
        let response = login(&state, br#"{"token":"A1"}"#, "req_2").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["request_id"], "req_2");
        assert!(store.get().is_none());

        let response = login(&state, br#"{"token":"","refreshToken":"B1"}"#, "req_3").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn logout_clears_and_reports_login_route() {
        let (state, store) = state(Some(CredentialPair::new("A1", "B1")));
        assert_eq!(body_json(status(&state)).await["authenticated"], true);

        let response = logout(&state).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.get().is_none());

        let json = body_json(status(&state)).await;
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["login_route"], "/login");

        // Logging out twice is harmless
        assert_eq!(logout(&state).await.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.navigator.logouts(), 2);
    }

    #[tokio::test]
    async fn login_after_logout_clears_login_route() {
        let (state, _store) = state(Some(CredentialPair::new("A1", "B1")));
        logout(&state).await;
        login(&state, br#"{"token":"A9","refreshToken":"B9"}"#, "req_4").await;

        let json = body_json(status(&state)).await;
        assert_eq!(json["authenticated"], true);
        assert!(json.get("login_route").is_none());
    }
}
