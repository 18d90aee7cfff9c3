use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ocrd::LimitExceeded;

use crate::error::ServerError;
use crate::metrics;
use crate::state::ServerState;

const CORS_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_HEADERS: &str = "Content-Type, Authorization, X-Requested-With";
/// Preflight results may be cached for a day.
const CORS_MAX_AGE: &str = "86400";

/// Cross-origin headers plus request metrics.
///
/// `OPTIONS` preflights are answered directly with 200. For everything
/// else the downstream handler runs first and the request counter and
/// latency histogram are recorded afterwards, labelled with method,
/// path and the final status.
pub async fn cors_and_metrics(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors(&mut response);
        return response;
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;
    apply_cors(&mut response);
    metrics::record_http_request(&method, &path, response.status(), start.elapsed());
    response
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(CORS_MAX_AGE),
    );
}

/// Per-client rate limiting.
///
/// Client identity is the first `X-Forwarded-For` entry, else
/// `X-Real-IP`, else the peer address without the port. The request's
/// `Content-Length` counts against the daily byte quota. Rejections are
/// 429 with diagnostic headers and a machine-readable error body.
pub async fn rate_limit(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.config().enabled {
        return next.run(request).await;
    }

    let client = client_identity(&request);
    let data_size = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    if let Err(limited) = state.limiter.check(&client, data_size) {
        let kind = match &limited {
            LimitExceeded::RateLimit { kind, .. } => kind.as_str(),
            LimitExceeded::Quota { kind, .. } => kind.as_str(),
        };
        metrics::record_rate_limit_hit(kind);
        tracing::debug!(client = %client, kind, "request rate limited");
        return ServerError::Limited(limited).into_response();
    }
    next.run(request).await
}

fn client_identity(request: &Request) -> String {
    let headers = request.headers();
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Accept or mint a request id and reflect it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(id.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Structured request/response logging.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<String>()
        .cloned()
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(request).await;
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        duration_ms = %start.elapsed().as_millis(),
        request_id = %request_id,
        "request completed"
    );
    response
}
