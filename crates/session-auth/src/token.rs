//! Token refresh exchange
//!
//! One POST to the refresh endpoint with the current (possibly expired) access
//! token and the refresh token. The server answers with the API's standard
//! envelope:
//!
//! ```json
//! { "success": true, "body": { "token": "...", "refreshToken": "...", ... }, "errors": null }
//! ```
//!
//! No retries happen here. The coordinator decides what a failure means.
//! The exchange uses a bare `reqwest::Client`, never the request interceptor,
//! so a 401 from this endpoint can't trigger another refresh.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

/// Request body sent to the refresh endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub access_token: &'a str,
    pub refresh_token: &'a str,
}

impl<'a> From<&'a CredentialPair> for RefreshRequest<'a> {
    fn from(pair: &'a CredentialPair) -> Self {
        Self {
            access_token: pair.access_token.expose(),
            refresh_token: pair.refresh_token.expose(),
        }
    }
}

/// Response envelope returned by the refresh endpoint.
#[derive(Debug, Deserialize)]
pub struct RefreshEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<Value>>,
}

impl RefreshEnvelope {
    /// Extract the new pair, or a `Rejected` error carrying the server's messages.
    pub fn into_pair(self) -> Result<CredentialPair> {
        if !self.success {
            return Err(Error::Rejected(describe_errors(self.errors.as_deref())));
        }
        let body = match self.body {
            Some(Value::Null) | None => {
                return Err(Error::Rejected("envelope has no body".into()));
            }
            Some(body) => body,
        };
        serde_json::from_value(body)
            .map_err(|e| Error::Rejected(format!("envelope body has no token pair: {e}")))
    }
}

/// Flatten the envelope's error list into one message.
///
/// Entries are either plain strings or objects with a `message` or
/// `description` field; anything else is rendered as JSON.
fn describe_errors(errors: Option<&[Value]>) -> String {
    let messages: Vec<String> = errors
        .unwrap_or_default()
        .iter()
        .map(|e| match e {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .or_else(|| obj.get("description"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| e.to_string()),
            other => other.to_string(),
        })
        .collect();

    if messages.is_empty() {
        "server reported failure without errors".into()
    } else {
        messages.join("; ")
    }
}

/// Exchanges a refresh token for a new credential pair.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn RefreshExchange>`).
pub trait RefreshExchange: Send + Sync {
    fn refresh<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialPair>> + Send + 'a>>;
}

/// Refresh exchange over HTTP.
pub struct HttpRefreshExchange {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRefreshExchange {
    /// `endpoint` must be an absolute URL.
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RefreshExchange for HttpRefreshExchange {
    fn refresh<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialPair>> + Send + 'a>> {
        Box::pin(async move {
            debug!(endpoint = %self.endpoint, "exchanging refresh token");
            let response = self
                .client
                .post(&self.endpoint)
                .json(&RefreshRequest::from(pair))
                .send()
                .await
                .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));

                // 401/403 means the refresh token is revoked or expired
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(Error::InvalidCredentials(format!(
                        "refresh endpoint returned {status}: {body}"
                    )));
                }

                return Err(Error::TokenExchange(format!(
                    "refresh endpoint returned {status}: {body}"
                )));
            }

            response
                .json::<RefreshEnvelope>()
                .await
                .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?
                .into_pair()
        })
    }
}
