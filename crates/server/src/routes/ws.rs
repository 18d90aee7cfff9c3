//! Streaming OCR over WebSocket.
//!
//! Each text frame is one JSON request; the server answers with a
//! `processing` frame, an optional midpoint progress frame, and exactly
//! one `completed` or `error` frame carrying the same request id. The
//! connection is kept alive with 30-second pings and dropped after 60
//! seconds without traffic or pongs.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine as _;
use ocrd::pipeline::Engine;
use ocrd::{tensor, RequestConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServerError;
use crate::metrics;
use crate::state::ServerState;

/// Idle cutoff; refreshed by any inbound frame including pongs.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WsRequest {
    #[serde(rename = "type")]
    kind: String,
    /// Base64 payload for `image` requests.
    image: Option<String>,
    /// Base64 payload for `pdf` requests.
    pdf: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    pages: Option<String>,
    #[serde(default)]
    options: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct WsFrame {
    #[serde(rename = "type")]
    kind: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    error_type: Option<&'static str>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<u128>,
}

impl WsFrame {
    fn processing(kind: &str, request_id: u128, progress: f64) -> Self {
        Self {
            kind: kind.to_string(),
            status: "processing",
            progress: Some(progress),
            result: None,
            error: None,
            error_type: None,
            request_id: Some(request_id),
        }
    }

    fn completed(kind: &str, request_id: u128, result: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            status: "completed",
            progress: Some(1.0),
            result: Some(result),
            error: None,
            error_type: None,
            request_id: Some(request_id),
        }
    }

    fn error(request_id: u128, error_type: &'static str, message: String) -> Self {
        Self {
            kind: "error".to_string(),
            status: "error",
            progress: None,
            result: None,
            error: Some(message),
            error_type: Some(error_type),
            request_id: Some(request_id),
        }
    }
}

/// GET `/ws/ocr`
pub async fn ws_ocr(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    metrics::ws_connection_opened();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if last_activity.elapsed() >= READ_DEADLINE {
                    debug!("websocket read deadline expired");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else { break };
                last_activity = Instant::now();
                match message {
                    Message::Text(text) => {
                        metrics::ws_message("inbound");
                        if !handle_text(&state, &mut socket, text.as_str()).await {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        metrics::ws_message("inbound");
                        let frame = WsFrame::error(
                            next_request_id(),
                            "invalid_request",
                            "expected JSON text frames".to_string(),
                        );
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    metrics::ws_connection_closed();
}

/// Request IDs are nanosecond timestamps: unique per connection and
/// monotonic enough to order frames in client logs.
fn next_request_id() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> bool {
    let Ok(encoded) = serde_json::to_string(frame) else {
        return false;
    };
    metrics::ws_message("outbound");
    socket
        .send(Message::Text(Utf8Bytes::from(encoded)))
        .await
        .is_ok()
}

/// Process one inbound JSON request. Returns false when the transport
/// broke and the connection should be dropped; protocol-level errors are
/// reported in-band and keep the connection open.
async fn handle_text(state: &Arc<ServerState>, socket: &mut WebSocket, text: &str) -> bool {
    let request_id = next_request_id();
    let request: WsRequest = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            let frame =
                WsFrame::error(request_id, "invalid_request", format!("invalid JSON: {e}"));
            return send_frame(socket, &frame).await;
        }
    };

    match request.kind.as_str() {
        "image" => handle_image(state, socket, request, request_id).await,
        "pdf" => handle_pdf(state, socket, request, request_id).await,
        other => {
            let frame = WsFrame::error(
                request_id,
                "invalid_request",
                format!("unknown request type {other:?}"),
            );
            send_frame(socket, &frame).await
        }
    }
}

fn overrides_from_options(options: Option<&HashMap<String, String>>) -> RequestConfig {
    let Some(options) = options else {
        return RequestConfig::default();
    };
    let get = |key: &str| options.get(key).filter(|v| !v.is_empty());
    RequestConfig {
        language: get("language").cloned(),
        dictionary_path: get("dict").map(PathBuf::from),
        dictionary_languages: get("dict-langs")
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        detector_model_path: get("det-model").map(PathBuf::from),
        recognizer_model_path: get("rec-model").map(PathBuf::from),
        barcode: Default::default(),
    }
}

async fn handle_image(
    state: &Arc<ServerState>,
    socket: &mut WebSocket,
    request: WsRequest,
    request_id: u128,
) -> bool {
    let Some(payload) = request.image else {
        let frame = WsFrame::error(
            request_id,
            "invalid_request",
            "image request without image data".to_string(),
        );
        return send_frame(socket, &frame).await;
    };
    if !send_frame(socket, &WsFrame::processing("image", request_id, 0.0)).await {
        return false;
    }

    let outcome = async {
        let overrides = overrides_from_options(request.options.as_ref());
        overrides.validate()?;
        let engine = state.resolve_engine(&overrides)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&payload)
            .map_err(|e| ServerError::BadRequest(format!("invalid base64: {e}")))?;

        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let img = tensor::decode_image(&bytes)?;
            engine.process_image(&img)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("task join: {e}")))?;
        metrics::record_ocr("websocket_image", result.is_ok(), started.elapsed());
        let result = result?;
        metrics::record_ocr_output(
            "websocket_image",
            result.regions.iter().map(|r| r.text.len()).sum(),
            result.regions.len(),
        );
        serde_json::to_value(&result).map_err(|e| ServerError::Internal(e.to_string()))
    }
    .await;

    if !send_frame(socket, &WsFrame::processing("image", request_id, 0.5)).await {
        return false;
    }
    let frame = match outcome {
        Ok(result) => WsFrame::completed("image", request_id, result),
        Err(e) => WsFrame::error(request_id, "processing_error", e.to_string()),
    };
    send_frame(socket, &frame).await
}

async fn handle_pdf(
    state: &Arc<ServerState>,
    socket: &mut WebSocket,
    request: WsRequest,
    request_id: u128,
) -> bool {
    let Some(payload) = request.pdf else {
        let frame = WsFrame::error(
            request_id,
            "invalid_request",
            "pdf request without pdf data".to_string(),
        );
        return send_frame(socket, &frame).await;
    };
    if !send_frame(socket, &WsFrame::processing("pdf", request_id, 0.0)).await {
        return false;
    }

    let pages = request.pages.unwrap_or_default();
    let filename = request.filename.unwrap_or_else(|| "upload.pdf".to_string());
    let outcome = async {
        let overrides = overrides_from_options(request.options.as_ref());
        overrides.validate()?;
        let engine = state.resolve_engine(&overrides)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&payload)
            .map_err(|e| ServerError::BadRequest(format!("invalid base64: {e}")))?;

        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut staged = tempfile::Builder::new()
                .suffix(".pdf")
                .tempfile()
                .map_err(ocrd::OcrError::Io)?;
            staged.write_all(&bytes).map_err(ocrd::OcrError::Io)?;
            let mut result = engine.process_pdf(staged.path(), &pages)?;
            result.filename = filename;
            Ok::<_, ocrd::OcrError>(result)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("task join: {e}")))?;
        metrics::record_ocr("websocket_pdf", result.is_ok(), started.elapsed());
        let result = result?;
        serde_json::to_value(&result).map_err(|e| ServerError::Internal(e.to_string()))
    }
    .await;

    if !send_frame(socket, &WsFrame::processing("pdf", request_id, 0.5)).await {
        return false;
    }
    let frame = match outcome {
        Ok(result) => WsFrame::completed("pdf", request_id, result),
        Err(e) => WsFrame::error(request_id, "processing_error", e.to_string()),
    };
    send_frame(socket, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_with_wire_field_names() {
        let frame = WsFrame::error(7, "invalid_request", "nope".to_string());
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"errorType\":\"invalid_request\""));
        assert!(json.contains("\"requestId\":7"));
        assert!(json.contains("\"status\":\"error\""));
        // Absent fields stay off the wire.
        assert!(!json.contains("progress"));
        assert!(!json.contains("result"));
    }

    #[test]
    fn request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b >= a);
    }

    #[test]
    fn options_map_builds_overrides() {
        let mut options = HashMap::new();
        options.insert("language".to_string(), "de".to_string());
        options.insert("dict".to_string(), "d.txt".to_string());
        let cfg = overrides_from_options(Some(&options));
        assert_eq!(cfg.language.as_deref(), Some("de"));
        assert_eq!(cfg.dictionary_path, Some(PathBuf::from("d.txt")));
        assert!(overrides_from_options(None).is_empty());
    }
}
