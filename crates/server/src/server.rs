//! Server assembly: router, middleware stack, lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::middleware::{cors_and_metrics, log_requests, rate_limit, request_id};
use crate::routes::{self, batch, health, ocr, ws};
use crate::state::ServerState;

/// Build the router over shared state.
///
/// Middleware runs outermost-first: tracing, timeout, request id and
/// logging, then CORS + metrics, then rate limiting, then the body cap,
/// then the handler. The CORS layer sits outside the rate limiter so
/// 429 responses are counted and carry cross-origin headers.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let timeout = Duration::from_secs(state.config.timeout_secs.max(1));
    Router::new()
        .route("/health", get(health::health))
        .route("/models", get(health::models))
        .route("/metrics", get(health::metrics_exposition))
        .route("/ocr/image", post(ocr::ocr_image))
        .route("/ocr/pdf", post(ocr::ocr_pdf))
        .route("/ocr/batch", post(batch::ocr_batch))
        .route("/ws/ocr", get(ws::ws_ocr))
        .fallback(routes::not_found)
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes()))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn(cors_and_metrics))
        .layer(from_fn(log_requests))
        .layer(from_fn(request_id))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the OCR server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_target(false)
        .json()
        .init();

    let state = ServerState::new(config.clone())?;
    let app = build_router(state.clone());
    let addr: SocketAddr = config.socket_addr()?;

    tracing::info!(
        addr = %addr,
        max_upload_mb = config.max_upload_mb,
        rate_limit_enabled = config.rate_limit.enabled,
        overlay_enabled = config.overlay_enabled,
        "starting OCR server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = state.close() {
        tracing::error!(error = %e, "error while closing pipelines");
        return Err(e.into());
    }
    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
