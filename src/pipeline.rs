//! Pipeline composition.
//!
//! A [`Pipeline`] wires the stages together: detect → optional rectify →
//! optional orientation → recognize (with optional per-region textline
//! orientation) → post-filter. The [`Engine`] trait is the capability set
//! the request surface and batch processor depend on, so test doubles can
//! stand in without any inference runtime.

use std::path::Path;
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::detect::{Detection, Detector};
use crate::error::{OcrError, OcrResult};
use crate::orientation::{counter_rotate, OrientationClassifier};
use crate::pdf;
use crate::recognize::Recognizer;
use crate::rectify::RectifyEngine;
use crate::types::{
    BoundingBox, ImageResult, ImageTiming, Orientation, PageResult, PageTiming, PdfResult,
    PdfTiming, Region,
};

/// What a pipeline can do, from the caller's point of view.
pub trait Engine: Send + Sync {
    fn process_image(&self, img: &DynamicImage) -> OcrResult<ImageResult>;

    /// `page_range` uses the `N`/`N-M` comma grammar; empty means all pages.
    fn process_pdf(&self, path: &Path, page_range: &str) -> OcrResult<PdfResult>;

    /// Release inference sessions. Idempotent; later processing calls fail.
    fn close(&self) -> OcrResult<()>;
}

pub struct Pipeline {
    config: PipelineConfig,
    detector: Detector,
    recognizer: Recognizer,
    rectify: RectifyEngine,
    page_orientation: Option<OrientationClassifier>,
    textline_orientation: Option<OrientationClassifier>,
}

impl Pipeline {
    /// Build every configured stage. Any model that fails to load fails
    /// the whole build; nothing half-constructed is returned.
    pub fn new(config: &PipelineConfig) -> OcrResult<Self> {
        let detector = Detector::load(config)?;
        let recognizer = Recognizer::load(config)?;
        let rectify = RectifyEngine::load(config)?;
        let page_orientation = if config.orientation.enabled {
            Some(OrientationClassifier::load_page(config, config.orientation)?)
        } else {
            None
        };
        let textline_orientation = if config.textline_orientation.enabled {
            Some(OrientationClassifier::load_textline(
                config,
                config.textline_orientation,
            )?)
        } else {
            None
        };
        Ok(Self {
            config: config.clone(),
            detector,
            recognizer,
            rectify,
            page_orientation,
            textline_orientation,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Crop the axis-aligned envelope of a detection out of `img`.
    fn crop_region(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
        let (w, h) = img.dimensions();
        let x = bbox.x.max(0) as u32;
        let y = bbox.y.max(0) as u32;
        let cw = (bbox.width.max(1) as u32).min(w.saturating_sub(x).max(1));
        let ch = (bbox.height.max(1) as u32).min(h.saturating_sub(y).max(1));
        img.crop_imm(x, y, cw, ch)
    }

    fn recognize_regions(
        &self,
        img: &DynamicImage,
        detections: Vec<Detection>,
    ) -> OcrResult<Vec<Region>> {
        let mut crops = Vec::with_capacity(detections.len());
        let mut rotated_flags = vec![None; detections.len()];
        for (i, det) in detections.iter().enumerate() {
            let bbox = BoundingBox::enclosing(&det.polygon);
            let mut crop = Self::crop_region(img, &bbox);
            if let Some(cls) = &self.textline_orientation {
                let decision = cls.classify(&crop)?;
                if cls.should_apply(&decision) {
                    crop = counter_rotate(&crop, decision.angle);
                    rotated_flags[i] = Some(true);
                } else {
                    rotated_flags[i] = Some(false);
                }
            }
            crops.push(crop);
        }

        let recognized = self.recognizer.recognize_all(&crops)?;

        let mut regions = Vec::with_capacity(detections.len());
        for ((det, rec), rotated) in detections.into_iter().zip(recognized).zip(rotated_flags) {
            // Post-filter: regions the recognizer decoded nothing from
            // carry no information downstream.
            if rec.text.is_empty() {
                continue;
            }
            let bounding_box = BoundingBox::enclosing(&det.polygon);
            regions.push(Region {
                polygon: det.polygon,
                bounding_box,
                det_confidence: f64::from(det.confidence),
                text: rec.text,
                rec_confidence: rec.confidence,
                char_confidences: Some(rec.char_confidences),
                rotated,
                language: Some(self.config.language.clone()),
            });
        }
        Ok(regions)
    }
}

impl Engine for Pipeline {
    fn process_image(&self, img: &DynamicImage) -> OcrResult<ImageResult> {
        let total_start = Instant::now();

        let det_start = Instant::now();
        let mut detections = self.detector.detect(img)?;
        let mut detection_ns = det_start.elapsed().as_nanos() as u64;

        // Rectification and orientation reshape the page; detections
        // from the untransformed image would live in the wrong frame,
        // so the detector runs again on the transformed page.
        let mut working = img.clone();
        if let Some(rectified) = self.rectify.rectify(&working) {
            debug!(
                from = ?working.dimensions(),
                to = ?rectified.dimensions(),
                "page rectified"
            );
            working = rectified;
            let redetect = Instant::now();
            detections = self.detector.detect(&working)?;
            detection_ns += redetect.elapsed().as_nanos() as u64;
        }

        let mut orientation = None;
        if let Some(cls) = &self.page_orientation {
            let decision = cls.classify(&working)?;
            let apply = cls.should_apply(&decision);
            if apply {
                working = counter_rotate(&working, decision.angle);
                let redetect = Instant::now();
                detections = self.detector.detect(&working)?;
                detection_ns += redetect.elapsed().as_nanos() as u64;
            }
            orientation = Some(Orientation {
                angle: decision.angle,
                confidence: decision.confidence,
                applied: apply,
            });
        }

        let rec_start = Instant::now();
        let regions = self.recognize_regions(&working, detections)?;
        let recognition_ns = rec_start.elapsed().as_nanos() as u64;

        let (width, height) = working.dimensions();
        let mut result = ImageResult::new(width, height, regions);
        result.orientation = orientation;
        result.processing = ImageTiming {
            detection_ns,
            recognition_ns,
            total_ns: total_start.elapsed().as_nanos() as u64,
        };
        Ok(result)
    }

    fn process_pdf(&self, path: &Path, page_range: &str) -> OcrResult<PdfResult> {
        let total_start = Instant::now();

        let extraction_start = Instant::now();
        let total_pages = pdf::page_count(path)?;
        let selected = pdf::parse_page_range(page_range, total_pages)?;
        let rendered = pdf::rasterize_pages(path, &selected)?;
        let extraction_ns = extraction_start.elapsed().as_nanos() as u64;

        let mut pages = Vec::with_capacity(rendered.len());
        for page in rendered {
            let page_start = Instant::now();
            let image_result = self.process_image(&page.image)?;
            pages.push(PageResult {
                page_number: page.page_number,
                width: page.width,
                height: page.height,
                images: vec![image_result],
                processing: PageTiming {
                    total_ns: page_start.elapsed().as_nanos() as u64,
                },
            });
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(PdfResult {
            filename,
            total_pages,
            pages,
            processing: PdfTiming {
                extraction_ns,
                total_ns: total_start.elapsed().as_nanos() as u64,
            },
        })
    }

    fn close(&self) -> OcrResult<()> {
        let mut first_error: Option<OcrError> = None;
        let mut note = |r: OcrResult<()>| {
            if let Err(e) = r {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };
        note(self.detector.close());
        note(self.recognizer.close());
        note(self.rectify.close());
        if let Some(cls) = &self.page_orientation {
            note(cls.close());
        }
        if let Some(cls) = &self.textline_orientation {
            note(cls.close());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("language", &self.config.language)
            .field("detector_model", &self.config.detector_model_path)
            .field("recognizer_model", &self.config.recognizer_model_path)
            .finish_non_exhaustive()
    }
}
