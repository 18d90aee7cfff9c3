use std::sync::Arc;
use std::time::SystemTime;

use metrics_exporter_prometheus::PrometheusHandle;
use ocrd::pipeline::Engine;
use ocrd::{OcrError, OcrResult, Pipeline, PipelineCache, PipelineConfig, RateLimiter, RequestConfig};
use serde::Serialize;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::metrics;

/// Shared application state.
pub struct ServerState {
    pub config: ServerConfig,

    /// Pipeline built from the server's own configuration; serves every
    /// request without overrides. `None` when startup could not build it,
    /// in which case override-free requests are 503.
    default_engine: Option<Arc<dyn Engine>>,

    /// Base config the per-request overrides are applied on.
    base_pipeline: PipelineConfig,

    /// Override pipelines, fingerprint-keyed, built once each.
    pub cache: PipelineCache,

    pub limiter: RateLimiter,

    pub metrics: PrometheusHandle,

    pub started_at: SystemTime,
}

/// One entry of the `/models` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
    /// `detector`, `recognizer`, `orientation`, `rectify` or `other`,
    /// inferred from the filename.
    pub kind: &'static str,
}

impl ServerState {
    /// Build state including the default pipeline. A pipeline build
    /// failure is downgraded to a warning so the server can come up and
    /// serve health/metrics while models are being provisioned.
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let base_pipeline = config.base_pipeline();
        let default_engine: Option<Arc<dyn Engine>> = match Pipeline::new(&base_pipeline) {
            Ok(pipeline) => Some(Arc::new(pipeline)),
            Err(e) => {
                warn!(error = %e, "default pipeline unavailable");
                None
            }
        };
        Ok(Arc::new(Self {
            limiter: RateLimiter::new(config.rate_limit),
            metrics: metrics::install()?,
            base_pipeline,
            default_engine,
            cache: PipelineCache::new(),
            started_at: SystemTime::now(),
            config,
        }))
    }

    /// Test constructor with an injected engine and no model loading.
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn Engine>) -> anyhow::Result<Arc<Self>> {
        let base_pipeline = config.base_pipeline();
        Ok(Arc::new(Self {
            limiter: RateLimiter::new(config.rate_limit),
            metrics: metrics::install()?,
            base_pipeline,
            default_engine: Some(engine),
            cache: PipelineCache::new(),
            started_at: SystemTime::now(),
            config,
        }))
    }

    /// Pick the engine for a request: the default pipeline when no
    /// override is present, otherwise the cached pipeline for the
    /// effective configuration.
    pub fn resolve_engine(&self, overrides: &RequestConfig) -> ServerResult<Arc<dyn Engine>> {
        if overrides.is_empty() {
            return self
                .default_engine
                .clone()
                .ok_or_else(|| ServerError::Unavailable("OCR pipeline not initialized".into()));
        }
        let effective = overrides.apply(&self.base_pipeline);
        let pipeline = self.cache.get_or_create(&effective)?;
        Ok(pipeline)
    }

    /// Scan the models directory for ONNX graphs.
    pub fn models(&self) -> Vec<ModelInfo> {
        let Ok(entries) = std::fs::read_dir(&self.config.models_dir) else {
            return Vec::new();
        };
        let mut models: Vec<ModelInfo> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("onnx") {
                    return None;
                }
                let name = path.file_name()?.to_string_lossy().into_owned();
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some(ModelInfo {
                    kind: model_kind(&name),
                    name,
                    size_bytes,
                })
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    /// Shut down: close the default pipeline, then every cached one.
    /// All closes run; the first error wins.
    pub fn close(&self) -> OcrResult<()> {
        let mut first_error: Option<OcrError> = None;
        if let Some(engine) = &self.default_engine {
            if let Err(e) = engine.close() {
                first_error = Some(e);
            }
        }
        if let Err(e) = self.cache.close() {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn model_kind(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.contains("det") {
        "detector"
    } else if lower.contains("rec") {
        "recognizer"
    } else if lower.contains("cls") || lower.contains("orient") {
        "orientation"
    } else if lower.contains("uvdoc") || lower.contains("rectif") {
        "rectify"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_classifies_filenames() {
        assert_eq!(model_kind("det_mbnetv3.onnx"), "detector");
        assert_eq!(model_kind("rec_crnn.onnx"), "recognizer");
        assert_eq!(model_kind("orientation.onnx"), "orientation");
        assert_eq!(model_kind("uvdoc.onnx"), "rectify");
        assert_eq!(model_kind("something.onnx"), "other");
    }
}
