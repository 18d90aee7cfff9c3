//! Orientation classifiers.
//!
//! Two small classification models share one driver: the page classifier
//! distinguishes 0/90/180/270 degree rotations of a whole page, the
//! textline classifier distinguishes upright from upside-down region
//! crops. Rotations are only applied above the configured confidence
//! threshold.

use image::{imageops::FilterType, DynamicImage};

use crate::config::{OrientationOptions, PipelineConfig};
use crate::error::{OcrError, OcrResult};
use crate::inference::InferenceSession;
use crate::tensor;

/// Classifier input size, width × height.
const CLS_WIDTH: u32 = 192;
const CLS_HEIGHT: u32 = 48;

/// Conventional model filenames under `models_dir`.
const PAGE_MODEL: &str = "orientation.onnx";
const TEXTLINE_MODEL: &str = "textline.onnx";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationDecision {
    /// Rotation of the input in degrees.
    pub angle: i32,
    pub confidence: f64,
}

pub struct OrientationClassifier {
    session: InferenceSession,
    labels: &'static [i32],
    threshold: f64,
}

impl OrientationClassifier {
    /// Page-level classifier over {0, 90, 180, 270}.
    pub fn load_page(config: &PipelineConfig, options: OrientationOptions) -> OcrResult<Self> {
        Self::load(config, options, PAGE_MODEL, &[0, 90, 180, 270])
    }

    /// Textline classifier over {0, 180}.
    pub fn load_textline(config: &PipelineConfig, options: OrientationOptions) -> OcrResult<Self> {
        Self::load(config, options, TEXTLINE_MODEL, &[0, 180])
    }

    fn load(
        config: &PipelineConfig,
        options: OrientationOptions,
        filename: &str,
        labels: &'static [i32],
    ) -> OcrResult<Self> {
        let path = config.models_dir.join(filename);
        let session = InferenceSession::load(&path, config.num_threads)?;
        Ok(Self {
            session,
            labels,
            threshold: options.threshold,
        })
    }

    /// Classify the rotation of `img`.
    pub fn classify(&self, img: &DynamicImage) -> OcrResult<OrientationDecision> {
        let resized = img.resize_exact(CLS_WIDTH, CLS_HEIGHT, FilterType::CatmullRom);
        let input = tensor::to_centered_tensor(&resized);
        let output = self.session.run(&input)?;

        let flat: Vec<f32> = output.iter().copied().collect();
        if flat.len() < self.labels.len() {
            return Err(OcrError::Inference(format!(
                "orientation output has {} classes, expected {}",
                flat.len(),
                self.labels.len()
            )));
        }
        let (best, &score) = flat[..self.labels.len()]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| OcrError::Inference("empty orientation output".to_string()))?;
        Ok(OrientationDecision {
            angle: self.labels[best],
            confidence: f64::from(score),
        })
    }

    /// True when the decision is confident enough to act on.
    pub fn should_apply(&self, decision: &OrientationDecision) -> bool {
        decision.angle != 0 && decision.confidence >= self.threshold
    }

    pub fn close(&self) -> OcrResult<()> {
        self.session.close()
    }
}

/// Undo a detected clockwise rotation.
pub fn counter_rotate(img: &DynamicImage, angle: i32) -> DynamicImage {
    match angle.rem_euclid(360) {
        90 => img.rotate270(),
        180 => img.rotate180(),
        270 => img.rotate90(),
        _ => img.clone(),
    }
}
