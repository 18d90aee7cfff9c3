//! Multipart OCR endpoints.
//!
//! `/ocr/image` accepts one `image` file part plus optional text parts
//! carrying per-request overrides and the output format. `/ocr/pdf` is
//! the same shape around a `pdf` part and a `pages` range. Both share
//! the override → validate → pipeline-resolve → process flow.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use image::Rgba;
use ocrd::pipeline::Engine;
use ocrd::{output, overlay, tensor, ImageResult, RequestConfig};
use serde_json::json;

use crate::error::{ServerError, ServerResult};
use crate::metrics;
use crate::state::ServerState;

/// Parsed multipart request, shared by the image and PDF handlers.
#[derive(Debug, Default)]
pub(crate) struct UploadRequest {
    pub file: Option<(String, Vec<u8>)>,
    pub fields: HashMap<String, String>,
}

impl UploadRequest {
    /// Drain a multipart stream, keeping the file part named
    /// `file_field` and every text part.
    pub(crate) async fn read(
        mut multipart: Multipart,
        file_field: &str,
    ) -> ServerResult<Self> {
        let mut request = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == file_field {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("upload.{file_field}"));
                let bytes = field.bytes().await.map_err(multipart_error)?;
                request.file = Some((filename, bytes.to_vec()));
            } else {
                let value = field.text().await.map_err(multipart_error)?;
                request.fields.insert(name, value);
            }
        }
        Ok(request)
    }

    /// Build and validate the override set carried in the text parts.
    pub(crate) fn request_config(&self) -> ServerResult<RequestConfig> {
        let get = |key: &str| self.fields.get(key).filter(|v| !v.is_empty());
        let config = RequestConfig {
            language: get("language").cloned(),
            dictionary_path: get("dict").map(PathBuf::from),
            dictionary_languages: get("dict-langs")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            detector_model_path: get("det-model").map(PathBuf::from),
            recognizer_model_path: get("rec-model").map(PathBuf::from),
            barcode: ocrd::BarcodeOptions {
                enabled: get("barcode").is_some_and(|v| v == "true" || v == "1"),
                formats: get("barcode-formats")
                    .map(|v| v.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn multipart_error(err: MultipartError) -> ServerError {
    let text = err.body_text();
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE || text.contains("length limit") {
        ServerError::PayloadTooLarge
    } else {
        ServerError::BadRequest(format!("multipart: {text}"))
    }
}

/// Output format selection: form field first, query parameter second.
fn selected_format(
    fields: &HashMap<String, String>,
    query: &HashMap<String, String>,
) -> String {
    fields
        .get("format")
        .or_else(|| query.get("format"))
        .cloned()
        .unwrap_or_else(|| "json".to_string())
}

/// Color fallback chain: request field, server config, hard default.
fn overlay_color(
    field: Option<&String>,
    configured: Option<&String>,
    fallback: Rgba<u8>,
) -> Rgba<u8> {
    field
        .or(configured)
        .and_then(|raw| overlay::parse_hex_color(raw).ok())
        .unwrap_or(fallback)
}

/// POST `/ocr/image`
pub async fn ocr_image(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    multipart: Multipart,
) -> ServerResult<Response> {
    let mut upload = UploadRequest::read(multipart, "image").await?;
    let (filename, bytes) = upload
        .file
        .take()
        .ok_or_else(|| ServerError::BadRequest("No image file provided".into()))?;
    metrics::record_upload_size(bytes.len() as u64);

    let overrides = upload.request_config()?;
    let engine = state.resolve_engine(&overrides)?;

    let started = Instant::now();
    let processed = tokio::task::spawn_blocking(move || {
        let img = tensor::decode_image(&bytes)?;
        let result = engine.process_image(&img)?;
        Ok::<_, ocrd::OcrError>((img, result))
    })
    .await
    .map_err(|e| ServerError::Internal(format!("task join: {e}")))?;

    let elapsed = started.elapsed();
    metrics::record_ocr("image", processed.is_ok(), elapsed);
    let (img, result) = processed?;
    metrics::record_ocr_output(
        "image",
        result.regions.iter().map(|r| r.text.len()).sum(),
        result.regions.len(),
    );

    match selected_format(&upload.fields, &query).as_str() {
        "json" => Ok(Json(json!({ "ocr": result })).into_response()),
        "text" => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            result.plain_text(),
        )
            .into_response()),
        "csv" => {
            let csv = output::format_csv(&[(filename.as_str(), &result)])?;
            Ok(([(header::CONTENT_TYPE, "text/csv")], csv).into_response())
        }
        "overlay" => overlay_response(&state, &upload.fields, &img, &result),
        other => Err(ServerError::BadRequest(format!(
            "unknown output format {other:?}"
        ))),
    }
}

fn overlay_response(
    state: &ServerState,
    fields: &HashMap<String, String>,
    img: &image::DynamicImage,
    result: &ImageResult,
) -> ServerResult<Response> {
    if !state.config.overlay_enabled {
        return Err(ServerError::OverlayDisabled);
    }
    let box_color = overlay_color(
        fields.get("box-color"),
        state.config.overlay_box_color.as_ref(),
        overlay::DEFAULT_BOX_COLOR,
    );
    let polygon_color = overlay_color(
        fields.get("polygon-color"),
        state.config.overlay_polygon_color.as_ref(),
        overlay::DEFAULT_POLYGON_COLOR,
    );
    let png = overlay::render_png(img, &result.regions, box_color, polygon_color)
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// POST `/ocr/pdf`
pub async fn ocr_pdf(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    multipart: Multipart,
) -> ServerResult<Response> {
    let mut upload = UploadRequest::read(multipart, "pdf").await?;
    let (filename, bytes) = upload
        .file
        .take()
        .ok_or_else(|| ServerError::BadRequest("No pdf file provided".into()))?;
    metrics::record_upload_size(bytes.len() as u64);

    let overrides = upload.request_config()?;
    let engine = state.resolve_engine(&overrides)?;
    let pages = upload.fields.get("pages").cloned().unwrap_or_default();

    let started = Instant::now();
    let processed = tokio::task::spawn_blocking(move || {
        // The rasterizer reads from disk; stage the upload.
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

    let elapsed = started.elapsed();
    metrics::record_ocr("pdf", processed.is_ok(), elapsed);
    let result = processed?;
    let text_length: usize = result
        .pages
        .iter()
        .flat_map(|p| p.images.iter())
        .flat_map(|i| i.regions.iter())
        .map(|r| r.text.len())
        .sum();
    let region_count: usize = result
        .pages
        .iter()
        .flat_map(|p| p.images.iter())
        .map(|i| i.regions.len())
        .sum();
    metrics::record_ocr_output("pdf", text_length, region_count);

    match selected_format(&upload.fields, &query).as_str() {
        "json" => Ok(Json(json!({ "ocr": result })).into_response()),
        "text" => {
            let text = result
                .pages
                .iter()
                .flat_map(|p| p.images.iter())
                .map(|i| i.plain_text())
                .collect::<Vec<_>>()
                .join("\n");
            Ok((
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                text,
            )
                .into_response())
        }
        other => Err(ServerError::BadRequest(format!(
            "unknown output format {other:?}"
        ))),
    }
}
