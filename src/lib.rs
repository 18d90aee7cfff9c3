//! OCR inference pipeline core.
//!
//! The crate wraps an external ONNX inference runtime with everything a
//! serving or batch deployment needs around it:
//!
//! - **tensor I/O**: image decoding, constrained resizing, planar float
//!   tensors ([`tensor`])
//! - **stages**: DB-style text detection ([`detect`]), CTC recognition
//!   ([`recognize`]), page/textline orientation ([`orientation`]), and
//!   mask-driven perspective rectification ([`rectify`], [`geometry`])
//! - **composition**: the [`Pipeline`] and the [`Engine`] capability trait
//!   the request surface depends on ([`pipeline`])
//! - **serving support**: fingerprint-keyed single-flight pipeline cache
//!   ([`cache`]) and a per-client rate limiter with daily quotas
//!   ([`limiter`])
//! - **batch execution**: file discovery, worker pools, confidence
//!   filtering, overlay rendering, and text/JSON/CSV output ([`batch`],
//!   [`overlay`], [`output`])
//!
//! The HTTP/WebSocket surface lives in the companion `ocrd-server` crate;
//! the batch CLI binary is `ocrd-batch`.
//!
//! ## Quick start
//!
//! ```ignore
//! use ocrd::{Engine, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig {
//!     models_dir: "models".into(),
//!     language: "en".into(),
//!     ..PipelineConfig::default()
//! };
//! let pipeline = Pipeline::new(&config)?;
//! let image = ocrd::tensor::decode_image(&std::fs::read("page.png")?)?;
//! let result = pipeline.process_image(&image)?;
//! for region in &result.regions {
//!     println!("{} ({:.2})", region.text, region.rec_confidence);
//! }
//! pipeline.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod detect;
pub mod error;
pub mod geometry;
pub mod inference;
pub mod limiter;
pub mod orientation;
pub mod output;
pub mod overlay;
pub mod pdf;
pub mod pipeline;
pub mod recognize;
pub mod rectify;
pub mod tensor;
pub mod types;

pub use cache::{fingerprint, PipelineCache};
pub use config::{
    format_bytes, parse_memory_limit, BarcodeOptions, PipelineConfig, RateLimitConfig,
    RequestConfig,
};
pub use error::{OcrError, OcrResult};
pub use limiter::{LimitExceeded, QuotaKind, RateLimiter, UserUsage, WindowKind};
pub use pipeline::{Engine, Pipeline};
pub use types::{
    BoundingBox, ImageResult, ImageTiming, Orientation, PageResult, PdfResult, Region,
};
