//! JSON batch OCR endpoint.
//!
//! Small synchronous batches: at most ten items, processed in order,
//! each with its own pipeline resolution so items can carry different
//! overrides. Item failures are captured per item and never abort the
//! rest of the batch.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine as _;
use ocrd::pipeline::Engine;
use ocrd::{tensor, RequestConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ServerError, ServerResult};
use crate::metrics;
use crate::state::ServerState;

/// Hard cap on images + PDFs per call.
const MAX_BATCH_ITEMS: usize = 10;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub images: Vec<BatchImage>,
    #[serde(default)]
    pub pdfs: Vec<BatchPdf>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchImage {
    #[serde(default)]
    pub name: Option<String>,
    /// Base64-encoded image bytes.
    pub data: String,
    #[serde(default)]
    pub options: RequestConfig,
}

#[derive(Debug, Deserialize)]
pub struct BatchPdf {
    #[serde(default)]
    pub name: Option<String>,
    /// Base64-encoded PDF bytes.
    pub data: String,
    #[serde(default)]
    pub pages: Option<String>,
    #[serde(default)]
    pub options: RequestConfig,
}

#[derive(Debug, Serialize)]
pub struct BatchItemResult {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// POST `/ocr/batch`
pub async fn ocr_batch(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BatchRequest>,
) -> ServerResult<impl IntoResponse> {
    let total = request.images.len() + request.pdfs.len();
    if total == 0 {
        return Err(ServerError::BadRequest("empty batch".into()));
    }
    if total > MAX_BATCH_ITEMS {
        return Err(ServerError::BadRequest(format!(
            "batch of {total} items exceeds the limit of {MAX_BATCH_ITEMS}"
        )));
    }

    let batch_start = Instant::now();
    let mut results = Vec::with_capacity(total);

    for (idx, item) in request.images.into_iter().enumerate() {
        let name = item.name.unwrap_or_else(|| format!("image-{idx}"));
        let outcome =
            process_image_item(&state, &name, &item.data, &item.options).await;
        results.push(item_result(name, "image", outcome));
    }
    for (idx, item) in request.pdfs.into_iter().enumerate() {
        let name = item.name.unwrap_or_else(|| format!("pdf-{idx}"));
        let outcome = process_pdf_item(
            &state,
            &name,
            &item.data,
            item.pages.as_deref().unwrap_or(""),
            &item.options,
        )
        .await;
        results.push(item_result(name, "pdf", outcome));
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    let elapsed = batch_start.elapsed();
    metrics::record_ocr("batch", succeeded == results.len(), elapsed);

    Ok(Json(json!({
        "success": true,
        "results": results,
        "summary": BatchSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            duration_ms: elapsed.as_millis() as u64,
        },
    })))
}

fn item_result(
    name: String,
    kind: &'static str,
    outcome: Result<(serde_json::Value, Instant), ServerError>,
) -> BatchItemResult {
    match outcome {
        Ok((ocr, started)) => BatchItemResult {
            name,
            kind,
            success: true,
            ocr: Some(ocr),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) => BatchItemResult {
            name,
            kind,
            success: false,
            ocr: None,
            error: Some(e.to_string()),
            duration_ms: 0,
        },
    }
}

async fn process_image_item(
    state: &Arc<ServerState>,
    name: &str,
    data: &str,
    overrides: &RequestConfig,
) -> Result<(serde_json::Value, Instant), ServerError> {
    overrides.validate()?;
    let engine = state.resolve_engine(overrides)?;
    let bytes = decode_base64(name, data)?;

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let img = tensor::decode_image(&bytes)?;
        engine.process_image(&img)
    })
    .await
    .map_err(|e| ServerError::Internal(format!("task join: {e}")))?;
    metrics::record_ocr("batch_image", result.is_ok(), started.elapsed());

    let result = result?;
    let value =
        serde_json::to_value(&result).map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok((value, started))
}

async fn process_pdf_item(
    state: &Arc<ServerState>,
    name: &str,
    data: &str,
    pages: &str,
    overrides: &RequestConfig,
) -> Result<(serde_json::Value, Instant), ServerError> {
    overrides.validate()?;
    let engine = state.resolve_engine(overrides)?;
    let bytes = decode_base64(name, data)?;
    let pages = pages.to_string();
    let display_name = name.to_string();

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let mut staged = tempfile::Builder::new()
            .suffix(".pdf")
            .tempfile()
            .map_err(ocrd::OcrError::Io)?;
        staged.write_all(&bytes).map_err(ocrd::OcrError::Io)?;
        let mut result = engine.process_pdf(staged.path(), &pages)?;
        result.filename = display_name;
        Ok::<_, ocrd::OcrError>(result)
    })
    .await
    .map_err(|e| ServerError::Internal(format!("task join: {e}")))?;
    metrics::record_ocr("batch_pdf", result.is_ok(), started.elapsed());

    let result = result?;
    let value =
        serde_json::to_value(&result).map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok((value, started))
}

fn decode_base64(name: &str, data: &str) -> Result<Vec<u8>, ServerError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ServerError::BadRequest(format!("item {name}: invalid base64: {e}")))
}
