//! Text recognition stage.
//!
//! Crops detected regions, batches them through a CTC recognition model at
//! a fixed input height, and greedy-decodes the per-timestep class
//! probabilities against the character dictionary.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array4, ArrayView2, Axis, s};

use crate::config::PipelineConfig;
use crate::error::{OcrError, OcrResult};
use crate::inference::InferenceSession;
use crate::tensor;

/// Decoded text for one region.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f64,
    pub char_confidences: Vec<f64>,
}

pub struct Recognizer {
    session: InferenceSession,
    characters: Vec<String>,
    image_height: u32,
    max_width: u32,
    pad_width_multiple: u32,
    batch_size: usize,
}

impl Recognizer {
    pub fn load(config: &PipelineConfig) -> OcrResult<Self> {
        let path = config.resolve(&config.recognizer_model_path);
        let session = InferenceSession::load(&path, config.num_threads)?;

        let mut dict_paths: Vec<PathBuf> = config
            .dictionary_paths
            .iter()
            .map(|p| config.resolve(p))
            .collect();
        dict_paths.sort();
        let characters = load_dictionaries(&dict_paths)?;

        Ok(Self {
            session,
            characters,
            image_height: config.image_height.max(1),
            max_width: config.max_width.max(32),
            pad_width_multiple: config.pad_width_multiple.max(1),
            batch_size: config.batch_size.max(1),
        })
    }

    /// Recognize a list of region crops, preserving input order.
    pub fn recognize_all(&self, crops: &[DynamicImage]) -> OcrResult<Vec<Recognition>> {
        let mut results = Vec::with_capacity(crops.len());
        for batch in crops.chunks(self.batch_size) {
            results.extend(self.recognize_batch(batch)?);
        }
        Ok(results)
    }

    pub fn close(&self) -> OcrResult<()> {
        self.session.close()
    }

    fn recognize_batch(&self, crops: &[DynamicImage]) -> OcrResult<Vec<Recognition>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }

        // Every crop in the batch shares one padded width.
        let widths: Vec<u32> = crops.iter().map(|c| self.scaled_width(c)).collect();
        let batch_width = self.pad_up(widths.iter().copied().max().unwrap_or(32));

        let h = self.image_height as usize;
        let w = batch_width as usize;
        let mut input = Array4::<f32>::zeros((crops.len(), 3, h, w));
        for (i, (crop, &crop_w)) in crops.iter().zip(&widths).enumerate() {
            let resized = crop.resize_exact(crop_w, self.image_height, FilterType::CatmullRom);
            let tensor = tensor::to_centered_tensor(&resized);
            input
                .slice_mut(s![i..i + 1, .., .., ..crop_w as usize])
                .assign(&tensor);
        }

        let output = self.session.run(&input)?;
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[0] != crops.len() {
            return Err(OcrError::Inference(format!(
                "unexpected recognizer output shape {shape:?} for batch of {}",
                crops.len()
            )));
        }

        let mut decoded = Vec::with_capacity(crops.len());
        for i in 0..crops.len() {
            let probs = output.view().index_axis_move(Axis(0), i);
            let probs = probs
                .into_dimensionality::<ndarray::Ix2>()
                .map_err(|e| OcrError::Inference(e.to_string()))?;
            decoded.push(ctc_greedy_decode(&probs, &self.characters));
        }
        Ok(decoded)
    }

    /// Width of the crop at the model height, capped at `max_width`.
    fn scaled_width(&self, crop: &DynamicImage) -> u32 {
        let (w, h) = crop.dimensions();
        if h == 0 {
            return 32;
        }
        let scaled = (self.image_height as f32 * w as f32 / h as f32).ceil() as u32;
        scaled.clamp(16, self.max_width)
    }

    fn pad_up(&self, width: u32) -> u32 {
        width.div_ceil(self.pad_width_multiple) * self.pad_width_multiple
    }
}

/// Merge dictionaries in path order: CTC blank at index 0, then every
/// non-empty line of every file, then the space token.
fn load_dictionaries(paths: &[PathBuf]) -> OcrResult<Vec<String>> {
    let mut characters = vec!["blank".to_string()];
    for path in paths {
        read_dictionary(path, &mut characters)?;
    }
    characters.push(" ".to_string());
    Ok(characters)
}

fn read_dictionary(path: &Path, characters: &mut Vec<String>) -> OcrResult<()> {
    let file = std::fs::File::open(path).map_err(|e| OcrError::ModelLoad {
        path: path.to_path_buf(),
        reason: format!("dictionary: {e}"),
    })?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let ch = line.trim_end_matches(['\r', '\n']).to_string();
        if !ch.is_empty() {
            characters.push(ch);
        }
    }
    Ok(())
}

/// Greedy CTC decode of a `(T, C)` probability matrix: argmax per
/// timestep, collapse repeats, drop the blank class at index 0. The
/// sequence confidence is the mean of the emitted character confidences,
/// zero when nothing decodes.
fn ctc_greedy_decode(probs: &ArrayView2<'_, f32>, characters: &[String]) -> Recognition {
    let timesteps = probs.shape()[0];
    let classes = probs.shape()[1];

    let mut text = String::new();
    let mut char_confidences = Vec::new();
    let mut prev_class = 0usize;

    for t in 0..timesteps {
        let mut best = 0usize;
        let mut best_p = f32::NEG_INFINITY;
        for c in 0..classes {
            let p = probs[[t, c]];
            if p > best_p {
                best_p = p;
                best = c;
            }
        }
        if best != 0 && best != prev_class {
            if let Some(ch) = characters.get(best) {
                text.push_str(ch);
                char_confidences.push(f64::from(best_p));
            }
        }
        prev_class = best;
    }

    let confidence = if char_confidences.is_empty() {
        0.0
    } else {
        char_confidences.iter().sum::<f64>() / char_confidences.len() as f64
    };
    Recognition {
        text,
        confidence,
        char_confidences,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::io::Write;

    fn chars(symbols: &[&str]) -> Vec<String> {
        let mut v = vec!["blank".to_string()];
        v.extend(symbols.iter().map(|s| s.to_string()));
        v.push(" ".to_string());
        v
    }

    fn probs(rows: &[&[f32]]) -> Array2<f32> {
        let t = rows.len();
        let c = rows[0].len();
        Array2::from_shape_vec((t, c), rows.iter().flat_map(|r| r.iter().copied()).collect())
            .unwrap()
    }

    #[test]
    fn decode_collapses_repeats_and_blanks() {
        let dict = chars(&["a", "b"]);
        // Timesteps: a a blank b  ->  "ab"
        let p = probs(&[
            &[0.1, 0.8, 0.1, 0.0],
            &[0.1, 0.7, 0.2, 0.0],
            &[0.9, 0.05, 0.05, 0.0],
            &[0.1, 0.1, 0.8, 0.0],
        ]);
        let r = ctc_greedy_decode(&p.view(), &dict);
        assert_eq!(r.text, "ab");
        assert_eq!(r.char_confidences.len(), 2);
        let expected = (0.8 + 0.8) / 2.0;
        assert!((r.confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn decode_repeated_char_with_blank_separator() {
        let dict = chars(&["a"]);
        // a blank a -> "aa"
        let p = probs(&[&[0.1, 0.9, 0.0], &[0.9, 0.1, 0.0], &[0.2, 0.8, 0.0]]);
        let r = ctc_greedy_decode(&p.view(), &dict);
        assert_eq!(r.text, "aa");
    }

    #[test]
    fn decode_of_all_blanks_is_empty_with_zero_confidence() {
        let dict = chars(&["a"]);
        let p = probs(&[&[0.9, 0.1, 0.0], &[0.9, 0.1, 0.0]]);
        let r = ctc_greedy_decode(&p.view(), &dict);
        assert!(r.text.is_empty());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn dictionaries_merge_in_order_with_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        writeln!(std::fs::File::create(&a).unwrap(), "x\ny").unwrap();
        writeln!(std::fs::File::create(&b).unwrap(), "z").unwrap();

        let dict = load_dictionaries(&[a, b]).unwrap();
        assert_eq!(dict[0], "blank");
        assert_eq!(&dict[1..4], &["x", "y", "z"]);
        assert_eq!(dict.last().unwrap(), " ");
    }
}
