//! Document rectification.
//!
//! Runs a UV-map style model on a downsampled page image, derives the page
//! quadrilateral from the model's presence mask, and warps the original
//! image onto a canonical rectangle. Every non-fatal failure (disabled
//! engine, model failure, degenerate geometry) falls back to the original
//! image so OCR always has something to work on.

use std::path::Path;

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{ArrayD, Axis};
use tracing::{debug, warn};

use crate::config::{PipelineConfig, RectifyOptions};
use crate::error::{OcrError, OcrResult};
use crate::geometry::{self, Quad};
use crate::inference::InferenceSession;
use crate::tensor::{self, ImageConstraints};

/// Points below this count never form a reliable page outline.
const MIN_MASK_POINTS: usize = 100;

/// Mask channel carrying page presence in the model output.
const MASK_CHANNEL: usize = 2;

pub struct RectifyEngine {
    session: Option<InferenceSession>,
    options: RectifyOptions,
}

impl RectifyEngine {
    /// Build from pipeline config. A disabled config or absent model path
    /// yields an inert engine whose `apply` is the identity.
    pub fn load(config: &PipelineConfig) -> OcrResult<Self> {
        let options = config.rectify.clone();
        let session = match (&options.enabled, &options.model_path) {
            (true, Some(path)) => {
                let resolved = config.resolve(path);
                Some(InferenceSession::load(&resolved, config.num_threads)?)
            }
            (true, None) => {
                warn!("rectification enabled without a model path; stage disabled");
                None
            }
            _ => None,
        };
        Ok(Self { session, options })
    }

    pub fn enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Rectify `img` if a confident page quadrilateral is found; otherwise
    /// return the original unchanged.
    pub fn apply(&self, img: &DynamicImage) -> DynamicImage {
        self.rectify(img).unwrap_or_else(|| img.clone())
    }

    /// Like [`apply`](Self::apply) but distinguishes a skip: `None` means
    /// the stage was disabled, failed, or found no usable quadrilateral.
    pub fn rectify(&self, img: &DynamicImage) -> Option<DynamicImage> {
        let session = self.session.as_ref()?;
        match self.try_rectify(session, img) {
            Ok(Some(warped)) => Some(DynamicImage::ImageRgb8(warped)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "rectification failed, using original image");
                None
            }
        }
    }

    pub fn close(&self) -> OcrResult<()> {
        match &self.session {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    fn try_rectify(
        &self,
        session: &InferenceSession,
        img: &DynamicImage,
    ) -> OcrResult<Option<RgbImage>> {
        let resized = tensor::resize_within(img, ImageConstraints::default());
        let input =
            tensor::to_normalized_tensor(&resized, tensor::IMAGENET_MEAN, tensor::IMAGENET_STD);
        let output = session.run(&input)?;

        let mask = extract_mask(&output)?;
        let (mask_h, mask_w) = (mask.shape()[0], mask.shape()[1]);

        let mut points: Vec<[f32; 2]> = Vec::new();
        for y in 0..mask_h {
            for x in 0..mask_w {
                if mask[[y, x]] >= self.options.mask_threshold {
                    points.push([x as f32, y as f32]);
                }
            }
        }

        let coverage = points.len() as f32 / (mask_h * mask_w) as f32;
        if coverage < self.options.min_mask_coverage || points.len() < MIN_MASK_POINTS {
            debug!(coverage, points = points.len(), "mask too sparse, skipping");
            return Ok(None);
        }

        if let Some(dir) = &self.options.debug_dir {
            write_debug_mask(dir, &mask, self.options.mask_threshold);
        }

        let Some(rect) = geometry::min_area_rect(&points) else {
            return Ok(None);
        };
        let quad = geometry::order_quad(rect);

        let area_ratio = geometry::polygon_area(&quad) / (mask_h * mask_w) as f32;
        if area_ratio < self.options.min_rect_area_ratio {
            debug!(area_ratio, "quad too small, skipping");
            return Ok(None);
        }
        let avg_w = geometry::quad_avg_width(&quad);
        let avg_h = geometry::quad_avg_height(&quad);
        if avg_h <= 0.0 {
            return Ok(None);
        }
        let aspect = avg_w / avg_h;
        if aspect < self.options.min_aspect || aspect > self.options.max_aspect {
            debug!(aspect, "quad aspect outside bounds, skipping");
            return Ok(None);
        }

        // The quad lives in mask space; scale it back to the original
        // frame before warping.
        let (ow, oh) = img.dimensions();
        let sx = ow as f32 / mask_w.max(1) as f32;
        let sy = oh as f32 / mask_h.max(1) as f32;
        let src_quad: Quad = [
            [quad[0][0] * sx, quad[0][1] * sy],
            [quad[1][0] * sx, quad[1][1] * sy],
            [quad[2][0] * sx, quad[2][1] * sy],
            [quad[3][0] * sx, quad[3][1] * sy],
        ];

        let (target_w, target_h) = target_dims(self.options.output_height, aspect);

        let Some(warped) = geometry::warp_perspective(img, &src_quad, target_w, target_h) else {
            debug!("homography solve failed, skipping");
            return Ok(None);
        };

        if let Some(dir) = &self.options.debug_dir {
            write_debug_quad(dir, img, &src_quad);
            write_debug_comparison(dir, img, &warped);
        }
        Ok(Some(warped))
    }
}

/// Round down to a multiple of 32, never below 32.
fn floor_to_32(v: u32) -> u32 {
    (v / 32 * 32).max(32)
}

/// Warp target size: width derives from the raw output height and the
/// quad aspect; both dimensions are floored to multiples of 32 only
/// afterwards.
fn target_dims(output_height: u32, aspect: f32) -> (u32, u32) {
    let raw_w = (aspect * output_height as f32).round() as u32;
    (floor_to_32(raw_w), floor_to_32(output_height))
}

/// Pull the page-presence channel out of a `(1, C, H, W)` output.
fn extract_mask(output: &ArrayD<f32>) -> OcrResult<ndarray::Array2<f32>> {
    let shape = output.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] <= MASK_CHANNEL {
        return Err(OcrError::Inference(format!(
            "unexpected rectification output shape {shape:?}"
        )));
    }
    let mask = output
        .view()
        .index_axis_move(Axis(0), 0)
        .index_axis_move(Axis(0), MASK_CHANNEL);
    mask.into_dimensionality::<ndarray::Ix2>()
        .map(|v| v.to_owned())
        .map_err(|e| OcrError::Inference(e.to_string()))
}

fn debug_path(dir: &Path, label: &str) -> std::path::PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
    dir.join(format!("{stamp}_{label}.png"))
}

/// Grayscale mask with above-threshold pixels tinted red.
fn write_debug_mask(dir: &Path, mask: &ndarray::Array2<f32>, threshold: f32) {
    let (h, w) = (mask.shape()[0], mask.shape()[1]);
    let mut img = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let v = (mask[[y, x]].clamp(0.0, 1.0) * 255.0) as u8;
            let px = if mask[[y, x]] >= threshold {
                Rgb([255, v / 2, v / 2])
            } else {
                Rgb([v, v, v])
            };
            img.put_pixel(x as u32, y as u32, px);
        }
    }
    save_debug(dir, "mask", img);
}

/// Source image with the chosen quadrilateral drawn on top.
fn write_debug_quad(dir: &Path, img: &DynamicImage, quad: &Quad) {
    let mut canvas = img.to_rgb8();
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        imageproc::drawing::draw_line_segment_mut(
            &mut canvas,
            (a[0], a[1]),
            (b[0], b[1]),
            Rgb([0, 255, 0]),
        );
    }
    save_debug(dir, "quad", canvas);
}

/// Source and warped output side by side.
fn write_debug_comparison(dir: &Path, img: &DynamicImage, warped: &RgbImage) {
    let src = img.to_rgb8();
    let h = src.height().max(warped.height());
    let mut canvas = RgbImage::new(src.width() + warped.width(), h);
    image::imageops::replace(&mut canvas, &src, 0, 0);
    image::imageops::replace(&mut canvas, warped, i64::from(src.width()), 0);
    save_debug(dir, "comparison", canvas);
}

fn save_debug(dir: &Path, label: &str, img: RgbImage) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, dir = %dir.display(), "cannot create rectify debug dir");
        return;
    }
    let path = debug_path(dir, label);
    if let Err(e) = img.save(&path) {
        warn!(error = %e, path = %path.display(), "cannot write rectify debug image");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn disabled_engine_is_identity() {
        let config = PipelineConfig::default();
        let engine = RectifyEngine::load(&config).unwrap();
        assert!(!engine.enabled());

        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([7, 8, 9])));
        let out = engine.apply(&img);
        assert_eq!(out.to_rgb8().as_raw(), img.to_rgb8().as_raw());
    }

    #[test]
    fn enabled_without_model_path_stays_inert() {
        let mut config = PipelineConfig::default();
        config.rectify.enabled = true;
        let engine = RectifyEngine::load(&config).unwrap();
        assert!(!engine.enabled());
    }

    #[test]
    fn floor_to_32_behaves() {
        assert_eq!(floor_to_32(1024), 1024);
        assert_eq!(floor_to_32(1040), 1024);
        assert_eq!(floor_to_32(31), 32);
        assert_eq!(floor_to_32(0), 32);
    }

    #[test]
    fn target_width_comes_from_the_raw_height() {
        // 1.3 × 1010 rounds to 1313, then floors to 1312; flooring the
        // height first would give 1280 instead.
        assert_eq!(target_dims(1010, 1.3), (1312, 992));
        assert_eq!(target_dims(1024, 1.0), (1024, 1024));
        assert_eq!(target_dims(1024, 0.01), (32, 1024));
    }

    #[test]
    fn extract_mask_requires_three_channels() {
        let too_few = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 2, 8, 8]));
        assert!(extract_mask(&too_few).is_err());
        let ok = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 3, 8, 8]));
        assert!(extract_mask(&ok).is_ok());
    }
}
