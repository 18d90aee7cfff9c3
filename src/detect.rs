//! Text detection stage.
//!
//! Runs a DB-style detection model and turns its probability map into text
//! region polygons: threshold → dilate → contours → minimum-area
//! quadrilateral → score gate → unclip → rescale → optional NMS →
//! reading-order sort.

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::morphology::dilate;
use ndarray::{ArrayD, ArrayView2, Axis};

use crate::config::PipelineConfig;
use crate::error::{OcrError, OcrResult};
use crate::geometry::{min_area_rect, polygon_area, Point};
use crate::inference::InferenceSession;
use crate::tensor;

/// Candidate cap per image; degenerate masks can contour-explode.
const MAX_CANDIDATES: usize = 1000;

/// Minimum side length (pixels, map space) for a candidate region.
const MIN_SIDE: f32 = 3.0;

/// Region expansion factor applied after scoring.
const UNCLIP_RATIO: f32 = 1.6;

/// One detected region in source-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Quadrilateral around the text, four points.
    pub polygon: Vec<Point>,
    /// Mean probability inside the candidate box.
    pub confidence: f32,
}

pub struct Detector {
    session: InferenceSession,
    db_thresh: f32,
    db_box_thresh: f32,
    use_nms: bool,
    nms_threshold: f32,
}

impl Detector {
    pub fn load(config: &PipelineConfig) -> OcrResult<Self> {
        let path = config.resolve(&config.detector_model_path);
        let session = InferenceSession::load(&path, config.num_threads)?;
        Ok(Self {
            session,
            db_thresh: config.detector_thresholds.db,
            db_box_thresh: config.detector_thresholds.db_box,
            use_nms: config.use_nms,
            nms_threshold: config.nms_threshold,
        })
    }

    /// Detect text regions, returned in reading order in the coordinate
    /// frame of `img`.
    pub fn detect(&self, img: &DynamicImage) -> OcrResult<Vec<Detection>> {
        let resized = tensor::resize_to_multiple_of_32(img, detection_side_limit(img))?;
        let input = tensor::to_normalized_tensor(
            &resized,
            tensor::IMAGENET_MEAN,
            tensor::IMAGENET_STD,
        );
        let output = self.session.run(&input)?;
        let prob_map = probability_map(&output)?;
        let detections = self.postprocess(prob_map, img.dimensions());
        Ok(detections)
    }

    pub fn close(&self) -> OcrResult<()> {
        self.session.close()
    }

    fn postprocess(&self, pred: ArrayView2<'_, f32>, ori_shape: (u32, u32)) -> Vec<Detection> {
        let (src_w, src_h) = ori_shape;
        let (map_h, map_w) = (pred.shape()[0], pred.shape()[1]);

        let mut mask = GrayImage::new(map_w as u32, map_h as u32);
        for y in 0..map_h {
            for x in 0..map_w {
                let on = pred[[y, x]] > self.db_thresh;
                mask.put_pixel(x as u32, y as u32, Luma([if on { 255 } else { 0 }]));
            }
        }
        let mask = dilate(&mask, imageproc::distance_transform::Norm::L1, 1);

        let contours = find_contours::<u32>(&mask);
        let scale_x = src_w as f32 / map_w as f32;
        let scale_y = src_h as f32 / map_h as f32;

        let mut detections = Vec::new();
        for contour in contours.iter().take(MAX_CANDIDATES) {
            if contour.points.is_empty() {
                continue;
            }
            let points: Vec<Point> = contour
                .points
                .iter()
                .map(|p| [p.x as f32, p.y as f32])
                .collect();

            let Some(rect) = min_area_rect(&points) else {
                continue;
            };
            let w = (rect[1][0] - rect[0][0]).hypot(rect[1][1] - rect[0][1]);
            let h = (rect[3][0] - rect[0][0]).hypot(rect[3][1] - rect[0][1]);
            if w.min(h) < MIN_SIDE {
                continue;
            }

            let score = box_score(&pred, &rect);
            if score < self.db_box_thresh {
                continue;
            }

            let expanded = unclip(&rect, UNCLIP_RATIO);

            // Back to source-image coordinates.
            let polygon: Vec<Point> = expanded
                .iter()
                .map(|p| {
                    [
                        (p[0] * scale_x).clamp(0.0, (src_w.saturating_sub(1)) as f32),
                        (p[1] * scale_y).clamp(0.0, (src_h.saturating_sub(1)) as f32),
                    ]
                })
                .collect();
            let (bw, bh) = polygon_extent(&polygon);
            if bw <= MIN_SIDE || bh <= MIN_SIDE {
                continue;
            }

            detections.push(Detection {
                polygon,
                confidence: score,
            });
        }

        if self.use_nms {
            detections = suppress_overlaps(detections, self.nms_threshold);
        }
        sort_reading_order(&mut detections);
        detections
    }
}

/// Side limit grows with the input so large pages keep small text legible.
fn detection_side_limit(img: &DynamicImage) -> u32 {
    let max_wh = img.width().max(img.height());
    if max_wh < 960 {
        960
    } else if max_wh < 1500 {
        1500
    } else {
        2000
    }
}

/// Extract the 2-D probability map from a `(1, 1, H, W)` output tensor.
fn probability_map(output: &ArrayD<f32>) -> OcrResult<ArrayView2<'_, f32>> {
    let shape = output.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] == 0 {
        return Err(OcrError::Inference(format!(
            "unexpected detector output shape {shape:?}"
        )));
    }
    let map = output
        .view()
        .index_axis_move(Axis(0), 0)
        .index_axis_move(Axis(0), 0);
    map.into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| OcrError::Inference(e.to_string()))
}

/// Mean probability over the axis-aligned envelope of `points`.
fn box_score(bitmap: &ArrayView2<'_, f32>, points: &[Point]) -> f32 {
    let (height, width) = (bitmap.shape()[0], bitmap.shape()[1]);
    let clamp_x = |v: f32| (v as isize).clamp(0, width as isize - 1) as usize;
    let clamp_y = |v: f32| (v as isize).clamp(0, height as isize - 1) as usize;

    let xmin = clamp_x(points.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min).floor());
    let xmax = clamp_x(points.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max).ceil());
    let ymin = clamp_y(points.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min).floor());
    let ymax = clamp_y(points.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max).ceil());

    let mut sum = 0.0f32;
    let mut count = 0u32;
    for y in ymin..=ymax {
        for x in xmin..=xmax {
            sum += bitmap[[y, x]];
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Expand a quad outward from its centroid by the DB unclip offset
/// `area * ratio / perimeter`.
fn unclip(points: &[Point; 4], ratio: f32) -> Vec<Point> {
    let area = polygon_area(points);
    let mut perimeter = 0.0f32;
    for i in 0..4 {
        let j = (i + 1) % 4;
        perimeter += (points[j][0] - points[i][0]).hypot(points[j][1] - points[i][1]);
    }
    if perimeter == 0.0 {
        return points.to_vec();
    }
    let distance = area * ratio / perimeter;

    let cx = points.iter().map(|p| p[0]).sum::<f32>() / 4.0;
    let cy = points.iter().map(|p| p[1]).sum::<f32>() / 4.0;
    points
        .iter()
        .map(|p| {
            let dx = p[0] - cx;
            let dy = p[1] - cy;
            let len = dx.hypot(dy);
            if len > 0.0 {
                let scale = (len + distance) / len;
                [dx.mul_add(scale, cx), dy.mul_add(scale, cy)]
            } else {
                *p
            }
        })
        .collect()
}

fn polygon_extent(polygon: &[Point]) -> (f32, f32) {
    let min_x = polygon.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
    let max_x = polygon.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max);
    let min_y = polygon.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min);
    let max_y = polygon.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max);
    (max_x - min_x, max_y - min_y)
}

fn aabb(polygon: &[Point]) -> (f32, f32, f32, f32) {
    let min_x = polygon.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
    let max_x = polygon.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max);
    let min_y = polygon.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min);
    let max_y = polygon.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max);
    (min_x, min_y, max_x, max_y)
}

fn iou(a: &[Point], b: &[Point]) -> f32 {
    let (ax0, ay0, ax1, ay1) = aabb(a);
    let (bx0, by0, bx1, by1) = aabb(b);
    let ix = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
    let iy = (ay1.min(by1) - ay0.max(by0)).max(0.0);
    let inter = ix * iy;
    let union = (ax1 - ax0) * (ay1 - ay0) + (bx1 - bx0) * (by1 - by0) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy IoU suppression, keeping higher-confidence regions.
fn suppress_overlaps(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept
            .iter()
            .all(|k| iou(&k.polygon, &det.polygon) < threshold)
        {
            kept.push(det);
        }
    }
    kept
}

/// Top-to-bottom, then left-to-right within a row tolerance of 10px.
fn sort_reading_order(detections: &mut [Detection]) {
    const ROW_TOLERANCE: f32 = 10.0;
    if detections.len() <= 1 {
        return;
    }
    detections.sort_by(|a, b| {
        let (ax0, ay0, _, _) = aabb(&a.polygon);
        let (bx0, by0, _, _) = aabb(&b.polygon);
        ay0.total_cmp(&by0).then(ax0.total_cmp(&bx0))
    });
    // Insertion pass: sink each x-inverted neighbor leftward while it
    // stays on the same visual row.
    for i in 0..detections.len() - 1 {
        for j in (0..=i).rev() {
            let (ax0, ay0, _, _) = aabb(&detections[j].polygon);
            let (bx0, by0, _, _) = aabb(&detections[j + 1].polygon);
            if (by0 - ay0).abs() < ROW_TOLERANCE && bx0 < ax0 {
                detections.swap(j, j + 1);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            polygon: vec![[x, y], [x + w, y], [x + w, y + h], [x, y + h]],
            confidence: conf,
        }
    }

    #[test]
    fn nms_drops_heavy_overlap() {
        let kept = suppress_overlaps(
            vec![
                det(0.0, 0.0, 100.0, 20.0, 0.9),
                det(2.0, 1.0, 100.0, 20.0, 0.8),
                det(0.0, 100.0, 50.0, 20.0, 0.7),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn reading_order_is_row_major() {
        let mut dets = vec![
            det(200.0, 5.0, 50.0, 20.0, 0.9),
            det(0.0, 0.0, 50.0, 20.0, 0.9),
            det(0.0, 100.0, 50.0, 20.0, 0.9),
        ];
        sort_reading_order(&mut dets);
        let xs: Vec<f32> = dets.iter().map(|d| d.polygon[0][0]).collect();
        let ys: Vec<f32> = dets.iter().map(|d| d.polygon[0][1]).collect();
        assert_eq!(xs, vec![0.0, 200.0, 0.0]);
        assert_eq!(ys, vec![0.0, 5.0, 100.0]);
    }

    #[test]
    fn reading_order_untangles_a_whole_row() {
        // Three boxes on one visual row (y within tolerance), fully
        // x-inverted; a single swap pass would leave them scrambled.
        let mut dets = vec![
            det(300.0, 0.0, 50.0, 20.0, 0.9),
            det(200.0, 3.0, 50.0, 20.0, 0.9),
            det(100.0, 6.0, 50.0, 20.0, 0.9),
        ];
        sort_reading_order(&mut dets);
        let xs: Vec<f32> = dets.iter().map(|d| d.polygon[0][0]).collect();
        assert_eq!(xs, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn unclip_grows_the_quad() {
        let quad = [[10.0, 10.0], [30.0, 10.0], [30.0, 20.0], [10.0, 20.0]];
        let grown = unclip(&quad, 1.6);
        assert!(polygon_area(&grown) > polygon_area(&quad));
    }
}
