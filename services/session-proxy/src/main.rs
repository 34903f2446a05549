//! Session Proxy
//!
//! Single-binary Rust service that:
//! 1. Holds a user session (access + refresh token) on disk
//! 2. Forwards every request to the upstream API with the access token attached
//! 3. On a 401, refreshes the session once for all concurrent callers and replays
//! 4. Ends the session when the refresh is rejected

mod config;
mod metrics;
mod proxy;
mod service;
mod session;

use anyhow::{Context, Result};
use auth_pipeline::{
    HttpTransport, RefreshCoordinator, RefreshEndpoint, RequestInterceptor, SessionInvalidator,
};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use session_auth::{CredentialStore, FileCredentialStore, HttpRefreshExchange};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};
use crate::session::{SessionNavigator, SessionState};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: SessionState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Wire the request pipeline for `config` around an already-loaded store.
fn build_state(
    config: &Config,
    store: Arc<dyn CredentialStore>,
    prometheus: PrometheusHandle,
) -> AppState {
    let client = reqwest::Client::new();
    let refresh_url = config.session.refresh_url(&config.proxy.upstream_url);

    // The exchange talks to the refresh endpoint directly, never through the interceptor
    let exchange = Arc::new(HttpRefreshExchange::new(client.clone(), refresh_url));
    let refresh_endpoint = RefreshEndpoint::parse(exchange.endpoint());
    let mut coordinator = RefreshCoordinator::new(exchange, store.clone());
    if let Some(timeout) = config.session.refresh_timeout() {
        coordinator = coordinator.with_refresh_timeout(timeout);
    }

    let navigator = Arc::new(SessionNavigator::default());
    let invalidator = Arc::new(SessionInvalidator::new(
        store.clone(),
        navigator.clone(),
        config.session.login_route.clone(),
    ));

    let transport = Arc::new(HttpTransport::new(
        client,
        Duration::from_secs(config.proxy.timeout_secs),
    ));
    let interceptor = Arc::new(RequestInterceptor::new(
        transport,
        store.clone(),
        Arc::new(coordinator),
        invalidator.clone(),
        refresh_endpoint,
    ));

    let metrics = ServiceMetrics::new();
    AppState {
        proxy: ProxyState {
            interceptor,
            upstream_url: config.proxy.upstream_url.clone(),
            login_route: invalidator.login_route().to_string(),
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
            in_flight: metrics.in_flight.clone(),
        },
        session: SessionState {
            store,
            invalidator,
            navigator,
        },
        metrics,
        prometheus,
    }
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently processed requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/session",
            get(session_status_handler)
                .put(session_login_handler)
                .delete(session_logout_handler),
        )
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        refresh_url = %config.session.refresh_url(&config.proxy.upstream_url),
        login_route = %config.session.login_route,
        "configuration loaded"
    );

    let store = FileCredentialStore::load(
        config.session.credentials_path.clone(),
        config.session.storage_key.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to load credentials from {}",
            config.session.credentials_path.display()
        )
    })?;

    let app_state = build_state(&config, Arc::new(store), prometheus_handle);
    let in_flight = app_state.metrics.in_flight.clone();
    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: JSON with status, session presence, uptime and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let session = if state.session.store.get().is_some() {
        "active"
    } else {
        "none"
    };

    let body = serde_json::json!({
        "status": "healthy",
        "session": session,
        "logouts": state.session.navigator.logouts(),
        "last_login_route": state.session.navigator.last_route(),
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn session_status_handler(State(state): State<AppState>) -> Response {
    session::status(&state.session)
}

async fn session_login_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    session::login(&state.session, &body, &request_id).await
}

async fn session_logout_handler(State(state): State<AppState>) -> Response {
    session::logout(&state.session).await
}

/// Catch-all handler that proxies everything else to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
