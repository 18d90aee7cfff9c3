//! HTTP endpoint implementations.
//!
//! - `health`: liveness, model listing, metrics exposition
//! - `ocr`: multipart image and PDF OCR
//! - `batch`: JSON batch OCR
//! - `ws`: bidirectional streaming OCR

pub mod batch;
pub mod health;
pub mod ocr;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Fallback for undefined routes.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "Not found" })),
    )
        .into_response()
}
