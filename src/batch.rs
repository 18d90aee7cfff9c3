//! Parallel batch processing.
//!
//! Discovers input files, runs them through a shared [`Engine`] on a
//! bounded worker pool, applies confidence post-filters, and optionally
//! writes overlay renderings. Results stay aligned with the discovered
//! input order no matter which worker finishes first.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use glob::Pattern;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{OcrError, OcrResult};
use crate::overlay;
use crate::pipeline::Engine;
use crate::tensor;
use crate::types::ImageResult;

/// File discovery controls.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Walk directories recursively.
    pub recursive: bool,
    /// Basename globs a file must match (empty = match everything).
    pub include: Vec<String>,
    /// Basename globs that reject a file; evaluated before includes.
    pub exclude: Vec<String>,
}

/// Batch execution controls.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Worker threads; 0 = one per CPU.
    pub workers: usize,
    /// Drop regions below this detection confidence.
    pub min_det_confidence: f64,
    /// Drop regions below this recognition confidence.
    pub min_rec_confidence: f64,
    /// When set, write `<stem>_overlay.png` per image here.
    pub overlay_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            min_det_confidence: 0.0,
            min_rec_confidence: 0.0,
            overlay_dir: None,
        }
    }
}

/// Outcome for one input file.
#[derive(Debug)]
pub struct BatchItem {
    pub path: PathBuf,
    pub result: Option<ImageResult>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Aggregate counters for one batch run.
#[derive(Debug, Clone, Copy)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub workers: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// One entry per discovered path, in discovery order.
    pub items: Vec<BatchItem>,
    pub stats: BatchStats,
}

/// Expand input paths into the ordered list of files to process.
///
/// Files are kept iff they pass the patterns; directories are walked
/// (one level, or fully with `recursive`) and their matching files
/// appended in directory order. A missing input is a fatal error.
pub fn discover(inputs: &[PathBuf], options: &DiscoveryOptions) -> OcrResult<Vec<PathBuf>> {
    let include = compile_patterns(&options.include)?;
    let exclude = compile_patterns(&options.exclude)?;

    let mut files = Vec::new();
    for input in inputs {
        let meta = std::fs::metadata(input).map_err(|e| {
            OcrError::InvalidInput(format!("input {}: {e}", input.display()))
        })?;
        if meta.is_file() {
            if should_include(input, &include, &exclude) {
                files.push(input.clone());
            }
        } else {
            walk_dir(input, options.recursive, &include, &exclude, &mut files)?;
        }
    }
    Ok(files)
}

fn compile_patterns(raw: &[String]) -> OcrResult<Vec<Pattern>> {
    raw.iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| OcrError::InvalidInput(format!("pattern {p:?}: {e}")))
        })
        .collect()
}

fn walk_dir(
    dir: &Path,
    recursive: bool,
    include: &[Pattern],
    exclude: &[Pattern],
    out: &mut Vec<PathBuf>,
) -> OcrResult<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| OcrError::InvalidInput(format!("input {}: {e}", dir.display())))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            if recursive {
                walk_dir(&entry, recursive, include, exclude, out)?;
            }
        } else if should_include(&entry, include, exclude) {
            out.push(entry);
        }
    }
    Ok(())
}

/// Pattern law: excluded basenames never pass; otherwise an empty include
/// list passes everything, a non-empty one requires a match.
pub fn should_include(path: &Path, include: &[Pattern], exclude: &[Pattern]) -> bool {
    let basename = match path.file_name() {
        Some(name) => name.to_string_lossy(),
        None => return false,
    };
    if exclude.iter().any(|p| p.matches(&basename)) {
        return false;
    }
    include.is_empty() || include.iter().any(|p| p.matches(&basename))
}

/// Drop regions below either confidence floor and recompute the average.
/// Region order is preserved.
pub fn apply_filters(result: &mut ImageResult, min_det: f64, min_rec: f64) {
    result
        .regions
        .retain(|r| r.det_confidence >= min_det && r.rec_confidence >= min_rec);
    result.recompute_average();
}

/// Process `paths` on a worker pool, preserving input order in the
/// output. Per-image failures are captured on their item; only pool
/// construction can fail the whole batch.
pub fn process_paths(
    engine: &(dyn Engine),
    paths: &[PathBuf],
    options: &BatchOptions,
) -> OcrResult<BatchOutcome> {
    let started = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers)
        .build()
        .map_err(|e| OcrError::InvalidInput(format!("worker pool: {e}")))?;

    let items: Vec<BatchItem> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| process_one(engine, path, options))
            .collect()
    });

    let succeeded = items.iter().filter(|i| i.result.is_some()).count();
    let stats = BatchStats {
        total: items.len(),
        succeeded,
        failed: items.len() - succeeded,
        workers: pool.current_num_threads(),
        elapsed: started.elapsed(),
    };
    info!(
        total = stats.total,
        succeeded = stats.succeeded,
        failed = stats.failed,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "batch complete"
    );
    Ok(BatchOutcome { items, stats })
}

fn process_one(engine: &(dyn Engine), path: &Path, options: &BatchOptions) -> BatchItem {
    let started = Instant::now();
    let outcome = std::fs::read(path)
        .map_err(OcrError::from)
        .and_then(|bytes| tensor::decode_image(&bytes))
        .and_then(|img| engine.process_image(&img).map(|result| (img, result)));

    match outcome {
        Ok((img, mut result)) => {
            apply_filters(
                &mut result,
                options.min_det_confidence,
                options.min_rec_confidence,
            );
            if let Some(dir) = &options.overlay_dir {
                write_overlay(dir, path, &img, &result);
            }
            BatchItem {
                path: path.to_path_buf(),
                result: Some(result),
                error: None,
                duration: started.elapsed(),
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "image failed");
            BatchItem {
                path: path.to_path_buf(),
                result: None,
                error: Some(e.to_string()),
                duration: started.elapsed(),
            }
        }
    }
}

/// Overlay writing is best-effort; a failure never fails the image.
fn write_overlay(dir: &Path, source: &Path, img: &image::DynamicImage, result: &ImageResult) {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let target = dir.join(format!("{stem}_overlay.png"));

    let write = || -> OcrResult<()> {
        std::fs::create_dir_all(dir)?;
        let png = overlay::render_png(
            img,
            &result.regions,
            overlay::DEFAULT_BOX_COLOR,
            overlay::DEFAULT_POLYGON_COLOR,
        )?;
        std::fs::write(&target, png)?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(path = %target.display(), error = %e, "overlay write failed");
    }
}
