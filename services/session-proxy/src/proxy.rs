//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, and forwards them to
//! the upstream URL through the authenticated request pipeline. Upstream
//! responses, error statuses included, are returned verbatim. Pipeline
//! failures become JSON errors:
//!
//! ```json
//! {"error":{"type":"session_expired","message":"...","request_id":"req_...","login_route":"/login"}}
//! ```

use auth_pipeline::{Error as PipelineError, PendingRequest, RequestInterceptor};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1).
/// `host` is dropped as well so reqwest derives it from the upstream URL.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Largest inbound body the proxy will buffer for replay.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub interceptor: Arc<RequestInterceptor>,
    pub upstream_url: String,
    pub login_route: String,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight gauge when the request finishes, however it ends.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub(crate) fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    json_error(
        status,
        serde_json::json!({
            "error": {
                "type": error_type,
                "message": message,
                "request_id": request_id,
            }
        }),
    )
}

fn json_error(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Map a pipeline failure onto a client-facing response.
fn pipeline_error_response(err: &PipelineError, login_route: &str, request_id: &str) -> Response {
    match err {
        PipelineError::Refresh(_) => json_error(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({
                "error": {
                    "type": "session_expired",
                    "message": err.to_string(),
                    "request_id": request_id,
                    "login_route": login_route,
                }
            }),
        ),
        PipelineError::Timeout(_) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "proxy_error",
            &err.to_string(),
            request_id,
        ),
        PipelineError::Transport(_) => error_response(
            StatusCode::BAD_GATEWAY,
            "proxy_error",
            &err.to_string(),
            request_id,
        ),
        PipelineError::InvalidRequest(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            &err.to_string(),
            request_id,
        ),
    }
}

fn error_label(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::Refresh(_) => "refresh",
        PipelineError::Timeout(_) => "timeout",
        PipelineError::Transport(_) => "transport",
        PipelineError::InvalidRequest(_) => "invalid_request",
    }
}

/// Proxy an inbound request to upstream through the request pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);
    let started = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();

    // Build the upstream URL by appending the request path and query
    let upstream_url = if let Some(pq) = uri.path_and_query() {
        format!("{}{}", state.upstream_url.trim_end_matches('/'), pq)
    } else {
        state.upstream_url.clone()
    };

    // Collect request headers, stripping hop-by-hop
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let pending = PendingRequest::new(method.clone(), upstream_url)
        .with_headers(headers)
        .with_body(body_bytes);

    let response = match state.interceptor.execute(pending).await {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_upstream_error(error_label(&e));
            match &e {
                PipelineError::Refresh(_) => warn!(error = %e, "session refresh failed"),
                _ => error!(error = %e, "upstream request failed"),
            }
            pipeline_error_response(&e, &state.login_route, &request_id)
        }
    };

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
