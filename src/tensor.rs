//! Image decoding and tensor conversion.
//!
//! Models consume planar float tensors of shape `(1, C, H, W)`. This module
//! owns the decode → resize → normalize path; per-stage normalization
//! constants live with the stages that use them.

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array3, Array4, Axis};

use crate::error::{OcrError, OcrResult};

/// Maximum value of an 8-bit channel.
const PIXEL_MAX: f32 = 255.0;

/// Normalization mean used by the detection and rectification models (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Normalization std used by the detection and rectification models (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Bounds an image is resized into before inference, aspect preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConstraints {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ImageConstraints {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
        }
    }
}

/// Decode image bytes into memory. The decoder is chosen from the content,
/// not from any filename.
pub fn decode_image(bytes: &[u8]) -> OcrResult<DynamicImage> {
    if bytes.is_empty() {
        return Err(OcrError::InvalidInput("empty image payload".to_string()));
    }
    Ok(image::load_from_memory(bytes)?)
}

/// Resize `img` to fit the constraints, preserving aspect ratio. Images
/// already inside the envelope are returned unscaled.
pub fn resize_within(img: &DynamicImage, constraints: ImageConstraints) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= constraints.max_width && h <= constraints.max_height {
        return img.clone();
    }
    let scale = (constraints.max_width as f32 / w as f32)
        .min(constraints.max_height as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    img.resize_exact(new_w, new_h, FilterType::CatmullRom)
}

/// Resize so both sides are multiples of 32 and the longer side does not
/// exceed `limit`. Detection models require 32-aligned inputs.
pub fn resize_to_multiple_of_32(img: &DynamicImage, limit: u32) -> OcrResult<DynamicImage> {
    let (w, h) = img.dimensions();
    let longest = w.max(h) as f32;
    let ratio = if longest > limit as f32 {
        limit as f32 / longest
    } else {
        1.0
    };
    let resize_w = ((w as f32 * ratio / 32.0).round() as u32).max(1) * 32;
    let resize_h = ((h as f32 * ratio / 32.0).round() as u32).max(1) * 32;
    if resize_w == 0 || resize_h == 0 {
        return Err(OcrError::InvalidInput(format!(
            "image {w}x{h} resizes to a degenerate {resize_w}x{resize_h}"
        )));
    }
    Ok(img.resize_exact(resize_w, resize_h, FilterType::CatmullRom))
}

/// Convert to a planar `(1, 3, H, W)` tensor with per-channel
/// `(pixel/255 - mean) / std` normalization.
pub fn to_normalized_tensor(
    img: &DynamicImage,
    mean: [f32; 3],
    std: [f32; 3],
) -> Array4<f32> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut chw = Array3::<f32>::zeros((3, h as usize, w as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let value = (f32::from(pixel[c]) / PIXEL_MAX - mean[c]) / std[c];
            chw[[c, y as usize, x as usize]] = value;
        }
    }
    chw.insert_axis(Axis(0))
}

/// Convert to a planar `(1, 3, H, W)` tensor normalized to `[-1, 1]`, the
/// range recognition models expect.
pub fn to_centered_tensor(img: &DynamicImage) -> Array4<f32> {
    to_normalized_tensor(img, [0.5, 0.5, 0.5], [0.5, 0.5, 0.5])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, image::Rgb(rgb)))
    }

    #[test]
    fn decode_rejects_empty_and_garbage() {
        assert!(decode_image(&[]).is_err());
        assert!(decode_image(b"not an image").is_err());
    }

    #[test]
    fn resize_within_keeps_small_images() {
        let img = solid(100, 60, [10, 20, 30]);
        let out = resize_within(&img, ImageConstraints::default());
        assert_eq!(out.dimensions(), (100, 60));
    }

    #[test]
    fn resize_within_shrinks_preserving_aspect() {
        let img = solid(2048, 1024, [0, 0, 0]);
        let out = resize_within(&img, ImageConstraints::default());
        let (w, h) = out.dimensions();
        assert_eq!(w, 1024);
        assert_eq!(h, 512);
    }

    #[test]
    fn multiple_of_32_is_aligned() {
        let img = solid(317, 211, [0, 0, 0]);
        let out = resize_to_multiple_of_32(&img, 960).unwrap();
        let (w, h) = out.dimensions();
        assert_eq!(w % 32, 0);
        assert_eq!(h % 32, 0);
        assert!(w > 0 && h > 0);
    }

    #[test]
    fn tensor_layout_is_planar() {
        let img = solid(4, 2, [255, 0, 0]);
        let t = to_centered_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 4]);
        // Red channel saturates to +1, green/blue to -1.
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalized_tensor_applies_mean_std() {
        let img = solid(1, 1, [255, 255, 255]);
        let t = to_normalized_tensor(&img, IMAGENET_MEAN, IMAGENET_STD);
        let expected = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((t[[0, 0, 0, 0]] - expected).abs() < 1e-5);
    }
}
