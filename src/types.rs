//! Result types produced by the OCR pipeline.
//!
//! These are part of the public wire contract: the HTTP server serializes
//! them verbatim, the batch processor feeds them to the text/JSON/CSV
//! formatters, and tests assert on their invariants. Any incompatible
//! change here is a breaking API change.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest axis-aligned box containing every polygon point.
    pub fn enclosing(polygon: &[[f32; 2]]) -> Self {
        if polygon.is_empty() {
            return Self::default();
        }
        let mut min_x = f32::INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut max_y = f32::NEG_INFINITY;
        for p in polygon {
            min_x = min_x.min(p[0]);
            min_y = min_y.min(p[1]);
            max_x = max_x.max(p[0]);
            max_y = max_y.max(p[1]);
        }
        Self {
            x: min_x.floor() as i32,
            y: min_y.floor() as i32,
            width: (max_x - min_x).ceil() as i32,
            height: (max_y - min_y).ceil() as i32,
        }
    }
}

/// One detected text span.
///
/// Invariant: `polygon` and `bounding_box` describe the same region in the
/// coordinate frame of the source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Detection polygon, four or more points.
    pub polygon: Vec<[f32; 2]>,
    /// Axis-aligned bounding box of the polygon.
    pub bounding_box: BoundingBox,
    /// Detection-stage confidence in [0,1].
    pub det_confidence: f64,
    /// Recognized text, UTF-8.
    pub text: String,
    /// Recognition-stage confidence in [0,1].
    pub rec_confidence: f64,
    /// Per-character confidences, when the recognizer emits them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_confidences: Option<Vec<f64>>,
    /// Set when textline orientation rotated the crop before recognition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated: Option<bool>,
    /// Language tag the region was decoded with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Outcome of the page-orientation stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    /// Detected rotation in degrees: 0, 90, 180 or 270.
    pub angle: i32,
    /// Classifier confidence in [0,1].
    pub confidence: f64,
    /// Whether the rotation was applied to the image before recognition.
    pub applied: bool,
}

/// Stage timings for one image, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTiming {
    pub detection_ns: u64,
    pub recognition_ns: u64,
    pub total_ns: u64,
}

/// OCR output for a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    pub width: u32,
    pub height: u32,
    pub regions: Vec<Region>,
    /// Arithmetic mean of region detection confidences, 0 when empty.
    pub avg_det_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    pub processing: ImageTiming,
}

impl ImageResult {
    /// Build a result, computing the detection-confidence average.
    pub fn new(width: u32, height: u32, regions: Vec<Region>) -> Self {
        let avg = mean_det_confidence(&regions);
        Self {
            width,
            height,
            regions,
            avg_det_confidence: avg,
            orientation: None,
            processing: ImageTiming::default(),
        }
    }

    /// Recompute `avg_det_confidence` after the region set changed.
    pub fn recompute_average(&mut self) {
        self.avg_det_confidence = mean_det_confidence(&self.regions);
    }

    /// All region text joined with newlines, in region order.
    pub fn plain_text(&self) -> String {
        self.regions
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn mean_det_confidence(regions: &[Region]) -> f64 {
    if regions.is_empty() {
        0.0
    } else {
        regions.iter().map(|r| r.det_confidence).sum::<f64>() / regions.len() as f64
    }
}

/// Timings for one PDF, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfTiming {
    /// Page extraction / rasterization time.
    pub extraction_ns: u64,
    pub total_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTiming {
    pub total_ns: u64,
}

/// OCR output for one PDF page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-based page number in the source document.
    pub page_number: u32,
    pub width: u32,
    pub height: u32,
    /// One entry per processed page image.
    pub images: Vec<ImageResult>,
    pub processing: PageTiming,
}

/// OCR output for a whole PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfResult {
    pub filename: String,
    pub total_pages: u32,
    pub pages: Vec<PageResult>,
    pub processing: PdfTiming,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(det: f64) -> Region {
        Region {
            polygon: vec![[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]],
            bounding_box: BoundingBox::new(0, 0, 10, 5),
            det_confidence: det,
            text: "x".into(),
            rec_confidence: 0.9,
            char_confidences: None,
            rotated: None,
            language: None,
        }
    }

    #[test]
    fn average_is_mean_of_regions() {
        let r = ImageResult::new(100, 50, vec![region(0.8), region(0.6)]);
        assert!((r.avg_det_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn average_is_zero_when_empty() {
        let r = ImageResult::new(100, 50, vec![]);
        assert_eq!(r.avg_det_confidence, 0.0);
    }

    #[test]
    fn enclosing_box_covers_polygon() {
        let b = BoundingBox::enclosing(&[[1.2, 2.7], [8.9, 2.0], [9.1, 6.3], [1.0, 6.0]]);
        assert_eq!(b.x, 1);
        assert_eq!(b.y, 2);
        assert!(b.width >= 8);
        assert!(b.height >= 4);
    }
}
