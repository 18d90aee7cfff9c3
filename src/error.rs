//! Error types for the OCR pipeline core.
//!
//! Every pipeline layer converges on [`OcrError`] so callers can match on
//! the failure kind without depending on stage internals. The server crate
//! maps these onto HTTP statuses; the batch CLI maps them onto exit codes.

use std::path::PathBuf;

pub type OcrResult<T> = Result<T, OcrError>;

/// Pipeline error kinds.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// Malformed or rejected caller input (bad page range, invalid
    /// language code, unsafe path, undecodable image).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A model file could not be found or loaded.
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// The inference runtime failed or produced an unusable tensor.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The pipeline (or one of its sessions) was closed.
    #[error("pipeline is closed")]
    Closed,

    /// PDF loading or rasterization failed.
    #[error("pdf processing failed: {0}")]
    Pdf(String),

    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    /// True when the error originates from caller input rather than the
    /// pipeline or its models.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::ImageDecode(_))
    }
}
