//! Scripted collaborators shared by the pipeline's unit tests.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::StatusCode;
use session_auth::{CredentialPair, RefreshExchange};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::session::Navigator;
use crate::transport::{PendingRequest, Transport, TransportResponse};

pub(crate) const REFRESH_PATH: &str = "/api/auth/refresh-token";

/// Refresh exchange that replays a fixed list of outcomes.
///
/// A gated exchange records the call and then blocks until `release()`.
pub(crate) struct ScriptedExchange {
    outcomes: Mutex<VecDeque<session_auth::Result<CredentialPair>>>,
    seen: Mutex<Vec<CredentialPair>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl ScriptedExchange {
    pub(crate) fn new(outcomes: Vec<session_auth::Result<CredentialPair>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub(crate) fn gated(outcomes: Vec<session_auth::Result<CredentialPair>>) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(outcomes)
        }
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(64);
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<CredentialPair> {
        self.seen.lock().unwrap().clone()
    }
}

impl RefreshExchange for ScriptedExchange {
    fn refresh<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<CredentialPair>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(pair.clone());
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Err(session_auth::Error::TokenExchange(
                    "no scripted outcome left".into(),
                ))
            })
        })
    }
}

/// Upstream that accepts a set of bearer tokens.
///
/// - `/offline` fails at the transport level
/// - the refresh path always answers 401
/// - `/broken` answers 500
/// - anything else answers 200 for a valid token and 401 otherwise
pub(crate) struct ScriptedTransport {
    valid: Mutex<HashSet<String>>,
    sent: Mutex<Vec<PendingRequest>>,
    unauthorized: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn accepting(tokens: &[&str]) -> Self {
        Self {
            valid: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            sent: Mutex::new(Vec::new()),
            unauthorized: AtomicUsize::new(0),
        }
    }

    pub(crate) fn revoke(&self, token: &str) {
        self.valid.lock().unwrap().remove(token);
    }

    /// (path, bearer token) of every request sent, in order.
    pub(crate) fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| (path_of(&r.url), r.bearer_token().map(str::to_owned)))
            .collect()
    }

    pub(crate) fn unauthorized(&self) -> usize {
        self.unauthorized.load(Ordering::SeqCst)
    }
}

fn path_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: PendingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        Box::pin(async move {
            let path = path_of(&request.url);
            let token = request.bearer_token().map(str::to_owned);
            self.sent.lock().unwrap().push(request);

            if path == "/offline" {
                return Err(Error::Transport("connection refused".into()));
            }
            if path == REFRESH_PATH {
                return Ok(TransportResponse::new(StatusCode::UNAUTHORIZED, ""));
            }
            if path == "/broken" {
                return Ok(TransportResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "boom",
                ));
            }

            let authorized = token
                .as_deref()
                .is_some_and(|t| self.valid.lock().unwrap().contains(t));
            if authorized {
                Ok(TransportResponse::new(StatusCode::OK, format!("ok {path}")))
            } else {
                self.unauthorized.fetch_add(1, Ordering::SeqCst);
                Ok(TransportResponse::new(StatusCode::UNAUTHORIZED, "expired"))
            }
        })
    }
}

/// Navigator that records every route it was sent to.
#[derive(Default)]
pub(crate) struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub(crate) fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_string());
    }
}
