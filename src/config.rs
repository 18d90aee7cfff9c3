//! Pipeline and request configuration.
//!
//! [`PipelineConfig`] describes how a pipeline is built (model paths,
//! dictionaries, thresholds, stage toggles). [`RequestConfig`] is the
//! per-request override subset accepted by the HTTP surface; applying one to
//! a base config yields a new effective [`PipelineConfig`] without mutating
//! the base. [`RateLimitConfig`] bounds per-client traffic.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OcrError, OcrResult};

/// Detection thresholds for the DB postprocessing step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorThresholds {
    /// Binarization threshold applied to the probability map.
    #[serde(default = "default_db_thresh")]
    pub db: f32,
    /// Minimum mean score for a candidate box to survive.
    #[serde(default = "default_db_box_thresh")]
    pub db_box: f32,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            db: default_db_thresh(),
            db_box: default_db_box_thresh(),
        }
    }
}

/// Page orientation stage options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationOptions {
    #[serde(default)]
    pub enabled: bool,
    /// Minimum classifier confidence required to apply a rotation.
    #[serde(default = "default_orientation_threshold")]
    pub threshold: f64,
}

impl Default for OrientationOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_orientation_threshold(),
        }
    }
}

/// Document rectification options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectifyOptions {
    #[serde(default)]
    pub enabled: bool,
    /// UV-map model path; resolved against `models_dir` when relative.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Page-presence mask threshold in [0,1].
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,
    /// Target height of the rectified page.
    #[serde(default = "default_rectify_output_height")]
    pub output_height: u32,
    /// When set, debug PNGs are written here.
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,
    /// Minimum fraction of mask pixels above threshold.
    #[serde(default = "default_min_mask_coverage")]
    pub min_mask_coverage: f32,
    /// Minimum quad area as a fraction of the image area.
    #[serde(default = "default_min_rect_area_ratio")]
    pub min_rect_area_ratio: f32,
    #[serde(default = "default_min_rect_aspect")]
    pub min_aspect: f32,
    #[serde(default = "default_max_rect_aspect")]
    pub max_aspect: f32,
}

impl Default for RectifyOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: None,
            mask_threshold: default_mask_threshold(),
            output_height: default_rectify_output_height(),
            debug_dir: None,
            min_mask_coverage: default_min_mask_coverage(),
            min_rect_area_ratio: default_min_rect_area_ratio(),
            min_aspect: default_min_rect_aspect(),
            max_aspect: default_max_rect_aspect(),
        }
    }
}

/// Full pipeline build configuration.
///
/// Unknown keys in serialized form are ignored; zero values mean
/// "unenforced" where a limit is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory containing model files; relative model paths resolve here.
    pub models_dir: PathBuf,
    pub detector_model_path: PathBuf,
    pub recognizer_model_path: PathBuf,
    /// Character dictionaries, merged in sorted-path order.
    pub dictionary_paths: Vec<PathBuf>,
    pub language: String,
    /// Recognizer input height in pixels.
    pub image_height: u32,
    /// Maximum recognizer input width in pixels.
    pub max_width: u32,
    /// Recognizer widths are padded up to a multiple of this.
    pub pad_width_multiple: u32,
    /// Intra-op thread count for inference sessions; 0 = runtime default.
    pub num_threads: usize,
    pub detector_thresholds: DetectorThresholds,
    pub use_nms: bool,
    pub nms_threshold: f32,
    pub orientation: OrientationOptions,
    pub textline_orientation: OrientationOptions,
    pub rectify: RectifyOptions,
    /// Batch-processor worker count; 0 = number of CPUs.
    pub parallel_workers: usize,
    /// Recognition batch size.
    pub batch_size: usize,
    /// Soft memory budget in bytes; 0 = unenforced.
    pub memory_limit: u64,
    /// Hard cap on concurrent processing tasks; 0 = unbounded.
    pub max_concurrency: usize,
    /// Utilization fraction above which adaptive scaling sheds workers.
    pub resource_threshold: f64,
    /// Scale the worker pool with observed resource pressure.
    pub adaptive_scaling: bool,
    /// Apply backpressure instead of queueing unboundedly.
    pub backpressure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            detector_model_path: PathBuf::from("det.onnx"),
            recognizer_model_path: PathBuf::from("rec.onnx"),
            dictionary_paths: Vec::new(),
            language: "en".to_string(),
            image_height: 48,
            max_width: 320,
            pad_width_multiple: 32,
            num_threads: 0,
            detector_thresholds: DetectorThresholds::default(),
            use_nms: false,
            nms_threshold: 0.3,
            orientation: OrientationOptions::default(),
            textline_orientation: OrientationOptions::default(),
            rectify: RectifyOptions::default(),
            parallel_workers: 0,
            batch_size: 6,
            memory_limit: 0,
            max_concurrency: 0,
            resource_threshold: 0.8,
            adaptive_scaling: false,
            backpressure: false,
        }
    }
}

impl PipelineConfig {
    /// Resolve a model path against `models_dir` when it is relative.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }
}

/// Barcode decoding options riding along with a request.
///
/// Not part of the pipeline fingerprint: barcode decoding happens outside
/// the model pipeline and does not change pipeline identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarcodeOptions {
    pub enabled: bool,
    /// Symbologies to try, e.g. "qr", "ean13". Empty = all supported.
    pub formats: Vec<String>,
}

/// Per-request pipeline overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub language: Option<String>,
    pub dictionary_path: Option<PathBuf>,
    pub dictionary_languages: Vec<String>,
    pub detector_model_path: Option<PathBuf>,
    pub recognizer_model_path: Option<PathBuf>,
    pub barcode: BarcodeOptions,
}

const MAX_LANGUAGE_LEN: usize = 10;
const MAX_PATH_LEN: usize = 500;

impl RequestConfig {
    /// True when no override is present and the server's default pipeline
    /// can serve the request without touching the cache.
    pub fn is_empty(&self) -> bool {
        self.language.is_none()
            && self.dictionary_path.is_none()
            && self.dictionary_languages.is_empty()
            && self.detector_model_path.is_none()
            && self.recognizer_model_path.is_none()
    }

    /// Reject unsafe or malformed override values.
    ///
    /// Language codes are limited to 10 characters of `[a-zA-Z0-9_-]`.
    /// Paths must not contain `..`, newlines, carriage returns or other
    /// control characters, and must stay under 500 bytes.
    pub fn validate(&self) -> OcrResult<()> {
        if let Some(lang) = &self.language {
            validate_language(lang)?;
        }
        for lang in &self.dictionary_languages {
            validate_language(lang)?;
        }
        for path in [
            self.dictionary_path.as_deref(),
            self.detector_model_path.as_deref(),
            self.recognizer_model_path.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            validate_path(path)?;
        }
        Ok(())
    }

    /// Produce the effective config for this request. The base is never
    /// mutated.
    pub fn apply(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut cfg = base.clone();
        if let Some(lang) = &self.language {
            cfg.language = lang.clone();
        }
        if let Some(dict) = &self.dictionary_path {
            cfg.dictionary_paths = vec![dict.clone()];
        }
        if let Some(det) = &self.detector_model_path {
            cfg.detector_model_path = det.clone();
        }
        if let Some(rec) = &self.recognizer_model_path {
            cfg.recognizer_model_path = rec.clone();
        }
        cfg
    }
}

fn validate_language(lang: &str) -> OcrResult<()> {
    if lang.is_empty() || lang.len() > MAX_LANGUAGE_LEN {
        return Err(OcrError::InvalidInput(format!(
            "language code must be 1-{MAX_LANGUAGE_LEN} characters: {lang:?}"
        )));
    }
    if !lang
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(OcrError::InvalidInput(format!(
            "language code contains invalid characters: {lang:?}"
        )));
    }
    Ok(())
}

fn validate_path(path: &Path) -> OcrResult<()> {
    let raw = path.to_string_lossy();
    if raw.len() > MAX_PATH_LEN {
        return Err(OcrError::InvalidInput(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if raw.contains("..") {
        return Err(OcrError::InvalidInput(format!(
            "path must not contain '..': {raw}"
        )));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(OcrError::InvalidInput(
            "path must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Per-client traffic bounds. A zero limit is not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub max_requests_per_day: u32,
    /// Daily upload byte quota.
    pub max_data_per_day: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            max_requests_per_day: 10_000,
            max_data_per_day: 1 << 30,
        }
    }
}

fn default_db_thresh() -> f32 {
    0.3
}

fn default_db_box_thresh() -> f32 {
    0.5
}

fn default_orientation_threshold() -> f64 {
    0.7
}

fn default_mask_threshold() -> f32 {
    0.5
}

fn default_rectify_output_height() -> u32 {
    1024
}

fn default_min_mask_coverage() -> f32 {
    0.02
}

fn default_min_rect_area_ratio() -> f32 {
    0.05
}

fn default_min_rect_aspect() -> f32 {
    0.2
}

fn default_max_rect_aspect() -> f32 {
    5.0
}

const KIB: u64 = 1024;

/// Parse a human-readable byte size: `B`, `KB`, `MB`, `GB`, `TB` suffixes
/// (case-insensitive, binary multipliers), plain integers are bytes.
/// Anything unparseable yields 0, meaning "unenforced".
pub fn parse_memory_limit(input: &str) -> u64 {
    let s = input.trim();
    if s.is_empty() {
        return 0;
    }
    let upper = s.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("TB") {
        (n, KIB * KIB * KIB * KIB)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, KIB * KIB * KIB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, KIB * KIB)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, KIB)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };
    match digits.trim().parse::<u64>() {
        Ok(n) => n.saturating_mul(multiplier),
        Err(_) => 0,
    }
}

/// Render a byte count with the largest exact binary suffix, the inverse of
/// [`parse_memory_limit`] for values it can represent exactly.
pub fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [(&str, u64); 4] = [
        ("TB", KIB * KIB * KIB * KIB),
        ("GB", KIB * KIB * KIB),
        ("MB", KIB * KIB),
        ("KB", KIB),
    ];
    for (suffix, mult) in SUFFIXES {
        if bytes >= mult && bytes % mult == 0 {
            return format!("{}{suffix}", bytes / mult);
        }
    }
    format!("{bytes}B")
}
