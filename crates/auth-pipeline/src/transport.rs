//! HTTP transport seam
//!
//! The interceptor never talks to `reqwest` directly. It hands a
//! `PendingRequest` to a `Transport` and gets a fully buffered
//! `TransportResponse` back, which keeps the request cloneable for replay and
//! lets tests script upstream behavior without a socket.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use session_auth::CredentialPair;
use tracing::debug;

use crate::error::{Error, Result};

/// An outgoing request captured before send.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PendingRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Clone of this request carrying `pair`'s access token.
    ///
    /// Any `Authorization` header already present is replaced. The header
    /// value is marked sensitive so `Debug` output of the request hides it.
    pub fn with_bearer(&self, pair: &CredentialPair) -> Result<Self> {
        let mut value = HeaderValue::from_str(&pair.bearer())
            .map_err(|e| Error::InvalidRequest(format!("access token is not a valid header: {e}")))?;
        value.set_sensitive(true);

        let mut cloned = self.clone();
        cloned.headers.insert(AUTHORIZATION, value);
        Ok(cloned)
    }

    /// Token from the `Authorization: Bearer` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix(session_auth::BEARER_SCHEME)?
            .strip_prefix(' ')
    }
}

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Sends a request and buffers the response.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: PendingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>>;
}

/// `reqwest`-backed transport with a per-request timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: PendingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        Box::pin(async move {
            debug!(method = %request.method, url = %request.url, "sending upstream request");
            let response = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .timeout(self.timeout)
                .body(request.body)
                .send()
                .await
                .map_err(|e| classify_reqwest_error(&e, self.timeout))?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| classify_reqwest_error(&e, self.timeout))?;

            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn classify_reqwest_error(e: &reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("no response after {}s: {e}", timeout.as_secs()))
    } else {
        Error::Transport(e.to_string())
    }
}
