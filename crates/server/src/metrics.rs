//! Prometheus metrics.
//!
//! One process-global recorder; handlers and middleware record through
//! the `metrics` facade and `/metrics` renders the exposition text from
//! the handle.

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder, or return the already-installed handle.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    // A racing installer already set it; both handles render the same
    // recorder state.
    let _ = HANDLE.set(handle.clone());
    Ok(handle.clone())
}

/// Request count and latency, labelled by method, endpoint and status.
pub fn record_http_request(
    method: &Method,
    endpoint: &str,
    status: StatusCode,
    elapsed: Duration,
) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.as_u16().to_string(),
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
    )
    .record(elapsed.as_secs_f64());
}

/// One OCR execution. `kind` distinguishes the surfaces: `image`, `pdf`,
/// `batch`, `batch_image`, `batch_pdf`, `websocket_image`,
/// `websocket_pdf`.
pub fn record_ocr(kind: &'static str, success: bool, elapsed: Duration) {
    let status = if success { "success" } else { "error" };
    counter!(
        "ocr_requests_total",
        "type" => kind,
        "status" => status,
    )
    .increment(1);
    histogram!("ocr_processing_duration_seconds", "type" => kind).record(elapsed.as_secs_f64());
}

/// Output volume of one OCR execution.
pub fn record_ocr_output(kind: &'static str, text_length: usize, regions: usize) {
    histogram!("ocr_text_length", "type" => kind).record(text_length as f64);
    histogram!("ocr_regions_detected", "type" => kind).record(regions as f64);
}

pub fn record_rate_limit_hit(kind: &str) {
    counter!("rate_limit_hits_total", "type" => kind.to_string()).increment(1);
}

pub fn record_upload_size(bytes: u64) {
    histogram!("upload_size_bytes").record(bytes as f64);
}

pub fn ws_connection_opened() {
    gauge!("websocket_active_connections").increment(1.0);
}

pub fn ws_connection_closed() {
    gauge!("websocket_active_connections").decrement(1.0);
}

/// `direction` is `inbound` or `outbound`.
pub fn ws_message(direction: &'static str) {
    counter!("websocket_messages_total", "direction" => direction).increment(1);
}
