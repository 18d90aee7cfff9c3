//! Overlay rendering.
//!
//! Draws detection output back onto the source image: axis-aligned boxes
//! in one color, detection polygons in another. Used by the HTTP overlay
//! output format and the batch processor's `--overlay-dir`.

use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::error::{OcrError, OcrResult};
use crate::types::Region;

/// Default bounding-box color (red).
pub const DEFAULT_BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
/// Default polygon color (green).
pub const DEFAULT_POLYGON_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);

/// Parse `#RRGGBB` or `RRGGBB` into an opaque color.
pub fn parse_hex_color(input: &str) -> OcrResult<Rgba<u8>> {
    let hex = input.trim().strip_prefix('#').unwrap_or(input.trim());
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OcrError::InvalidInput(format!(
            "invalid color {input:?}, expected RRGGBB"
        )));
    }
    let r = u8::from_str_radix(&hex[0..2], 16).unwrap_or(0);
    let g = u8::from_str_radix(&hex[2..4], 16).unwrap_or(0);
    let b = u8::from_str_radix(&hex[4..6], 16).unwrap_or(0);
    Ok(Rgba([r, g, b, 255]))
}

/// Render regions onto a copy of `img`.
pub fn render(
    img: &DynamicImage,
    regions: &[Region],
    box_color: Rgba<u8>,
    polygon_color: Rgba<u8>,
) -> RgbaImage {
    let mut canvas = img.to_rgba8();
    for region in regions {
        draw_region(&mut canvas, region, box_color, polygon_color);
    }
    canvas
}

/// Render and encode to PNG bytes.
pub fn render_png(
    img: &DynamicImage,
    regions: &[Region],
    box_color: Rgba<u8>,
    polygon_color: Rgba<u8>,
) -> OcrResult<Vec<u8>> {
    let canvas = render(img, regions, box_color, polygon_color);
    let mut bytes = Vec::new();
    canvas
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .map_err(OcrError::ImageDecode)?;
    Ok(bytes)
}

fn draw_region(
    canvas: &mut RgbaImage,
    region: &Region,
    box_color: Rgba<u8>,
    polygon_color: Rgba<u8>,
) {
    let b = &region.bounding_box;
    if b.width > 0 && b.height > 0 {
        let rect = Rect::at(b.x, b.y).of_size(b.width as u32, b.height as u32);
        draw_hollow_rect_mut(canvas, rect, box_color);
    }
    let n = region.polygon.len();
    if n >= 2 {
        for i in 0..n {
            let a = region.polygon[i];
            let b = region.polygon[(i + 1) % n];
            draw_line_segment_mut(canvas, (a[0], a[1]), (b[0], b[1]), polygon_color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::Rgb;

    fn test_region() -> Region {
        Region {
            polygon: vec![[2.0, 2.0], [12.0, 2.0], [12.0, 8.0], [2.0, 8.0]],
            bounding_box: BoundingBox::new(2, 2, 10, 6),
            det_confidence: 0.9,
            text: "hi".into(),
            rec_confidence: 0.8,
            char_confidences: None,
            rotated: None,
            language: None,
        }
    }

    #[test]
    fn hex_colors_parse_with_and_without_hash() {
        assert_eq!(parse_hex_color("#ff0000").unwrap(), Rgba([255, 0, 0, 255]));
        assert_eq!(parse_hex_color("00FF7f").unwrap(), Rgba([0, 255, 127, 255]));
        assert!(parse_hex_color("#12345").is_err());
        assert!(parse_hex_color("zzzzzz").is_err());
        assert!(parse_hex_color("").is_err());
    }

    #[test]
    fn render_marks_box_corners() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            20,
            12,
            Rgb([255, 255, 255]),
        ));
        let canvas = render(
            &img,
            &[test_region()],
            DEFAULT_BOX_COLOR,
            DEFAULT_POLYGON_COLOR,
        );
        // Box corner carries one of the two overlay colors.
        let px = canvas.get_pixel(2, 2);
        assert!(
            *px == DEFAULT_BOX_COLOR || *px == DEFAULT_POLYGON_COLOR,
            "corner pixel untouched: {px:?}"
        );
        // A pixel well outside the region stays white.
        assert_eq!(canvas.get_pixel(18, 11), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn render_png_emits_png_magic() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(16, 16));
        let bytes = render_png(
            &img,
            &[test_region()],
            DEFAULT_BOX_COLOR,
            DEFAULT_POLYGON_COLOR,
        )
        .unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
