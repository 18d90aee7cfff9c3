//! Batch processor integration tests with an engine double.
//!
//! Real files on disk, a fake engine instead of models: these cover
//! discovery, order preservation, per-image failure capture, confidence
//! filtering and overlay emission end to end.

use std::path::{Path, PathBuf};

use image::GenericImageView;
use ocrd::batch::{self, BatchOptions, DiscoveryOptions};
use ocrd::pipeline::Engine;
use ocrd::types::{BoundingBox, Region};
use ocrd::{output, ImageResult, OcrError, OcrResult, PdfResult};

/// Engine double: two regions per image, brightness-derived text so
/// different inputs are distinguishable.
struct FakeEngine;

fn region(text: &str, det: f64, rec: f64) -> Region {
    Region {
        polygon: vec![[0.0, 0.0], [20.0, 0.0], [20.0, 8.0], [0.0, 8.0]],
        bounding_box: BoundingBox::new(0, 0, 20, 8),
        det_confidence: det,
        text: text.into(),
        rec_confidence: rec,
        char_confidences: None,
        rotated: None,
        language: Some("en".into()),
    }
}

impl Engine for FakeEngine {
    fn process_image(&self, img: &image::DynamicImage) -> OcrResult<ImageResult> {
        let brightness = img.to_rgb8().get_pixel(0, 0)[0];
        Ok(ImageResult::new(
            img.width(),
            img.height(),
            vec![
                region(&format!("bright-{brightness}"), 0.9, 0.9),
                region("faint", 0.2, 0.9),
            ],
        ))
    }

    fn process_pdf(&self, _path: &Path, _page_range: &str) -> OcrResult<PdfResult> {
        Err(OcrError::Pdf("not used here".into()))
    }

    fn close(&self) -> OcrResult<()> {
        Ok(())
    }
}

fn write_png(path: &Path, brightness: u8) {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([brightness, 0, 0]));
    image::DynamicImage::ImageRgb8(img).save(path).unwrap();
}

#[test]
fn batch_preserves_input_order_and_captures_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for (i, brightness) in [10u8, 20, 30, 40].iter().enumerate() {
        let path = dir.path().join(format!("img{i}.png"));
        write_png(&path, *brightness);
        paths.push(path);
    }
    // A non-image in the middle must fail alone.
    let broken = dir.path().join("broken.png");
    std::fs::write(&broken, b"not a png at all").unwrap();
    paths.insert(2, broken.clone());

    let engine = FakeEngine;
    let outcome = batch::process_paths(
        &engine,
        &paths,
        &BatchOptions {
            workers: 4,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    assert_eq!(outcome.items.len(), 5);
    for (item, expected) in outcome.items.iter().zip(&paths) {
        assert_eq!(&item.path, expected, "order must match input");
    }
    assert_eq!(outcome.stats.succeeded, 4);
    assert_eq!(outcome.stats.failed, 1);
    let failed = &outcome.items[2];
    assert_eq!(failed.path, broken);
    assert!(failed.result.is_none());
    assert!(failed.error.is_some());
    // Brightness round-trips through the fake engine in input order.
    assert!(outcome.items[0]
        .result
        .as_ref()
        .unwrap()
        .regions
        .iter()
        .any(|r| r.text == "bright-10"));
    assert!(outcome.items[4]
        .result
        .as_ref()
        .unwrap()
        .regions
        .iter()
        .any(|r| r.text == "bright-40"));
}

#[test]
fn batch_applies_confidence_filters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.png");
    write_png(&path, 128);

    let engine = FakeEngine;
    let outcome = batch::process_paths(
        &engine,
        &[path],
        &BatchOptions {
            workers: 1,
            min_det_confidence: 0.5,
            min_rec_confidence: 0.5,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let result = outcome.items[0].result.as_ref().unwrap();
    // The low-detection "faint" region is filtered out.
    assert_eq!(result.regions.len(), 1);
    assert!((result.avg_det_confidence - 0.9).abs() < 1e-9);
}

#[test]
fn batch_writes_overlays_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let overlay_dir = dir.path().join("overlays");
    let path = dir.path().join("scan.png");
    write_png(&path, 200);

    let engine = FakeEngine;
    batch::process_paths(
        &engine,
        &[path],
        &BatchOptions {
            workers: 1,
            overlay_dir: Some(overlay_dir.clone()),
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let overlay = overlay_dir.join("scan_overlay.png");
    assert!(overlay.exists(), "overlay file missing");
    let bytes = std::fs::read(overlay).unwrap();
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
}

#[test]
fn discovery_then_formatting_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("subdir");
    std::fs::create_dir(&sub).unwrap();
    write_png(&dir.path().join("root.png"), 1);
    write_png(&sub.join("sub.png"), 2);
    std::fs::write(sub.join("sub.txt"), b"ignored").unwrap();

    let discovered = batch::discover(
        &[dir.path().to_path_buf()],
        &DiscoveryOptions {
            recursive: true,
            include: vec!["*.png".to_string()],
            exclude: vec![],
        },
    )
    .unwrap();
    assert_eq!(
        discovered,
        vec![dir.path().join("root.png"), sub.join("sub.png")]
    );

    let engine = FakeEngine;
    let outcome = batch::process_paths(&engine, &discovered, &BatchOptions::default()).unwrap();

    let labels: Vec<String> = outcome
        .items
        .iter()
        .map(|i| i.path.display().to_string())
        .collect();
    let entries: Vec<(&str, &ImageResult)> = outcome
        .items
        .iter()
        .zip(&labels)
        .filter_map(|(item, label)| item.result.as_ref().map(|r| (label.as_str(), r)))
        .collect();

    let text = output::format_text(&entries);
    assert!(text.contains(&format!("# {}", labels[0])));
    assert!(text.contains("bright-1"));

    let csv = output::format_csv(&entries).unwrap();
    assert_eq!(csv.lines().count(), 1 + 2 * 2, "header plus two rows per image");

    let json = output::format_json(&entries).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["images"].as_array().unwrap().len(), 2);
}

#[test]
fn missing_input_is_fatal_before_processing() {
    let missing = PathBuf::from("/definitely/not/here.png");
    let err = batch::discover(&[missing.clone()], &DiscoveryOptions::default()).unwrap_err();
    assert!(err.to_string().contains("not/here.png"));
}
