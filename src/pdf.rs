//! PDF page rasterization glue.
//!
//! pdfium does the actual rendering; this module keeps its types out of
//! the rest of the crate and owns the page-range grammar. pdfium handles
//! are not thread-safe, so a binding is created per call instead of being
//! stored on the pipeline.

use std::path::Path;

use image::{DynamicImage, GenericImageView};
use pdfium_render::prelude::*;

use crate::error::{OcrError, OcrResult};

const PDF_POINTS_PER_INCH: f32 = 72.0;

/// Rasterization resolution for OCR input.
pub const RENDER_DPI: u32 = 150;

/// One rendered page.
pub struct RasterizedPage {
    /// 1-based page number in the document.
    pub page_number: u32,
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
}

/// Parse a page-range expression: comma-separated `N` or `N-M` tokens,
/// 1-based and inclusive, e.g. `1,3-5`. Empty selects every page.
/// Out-of-range tokens are dropped; a selection that resolves to nothing
/// is an error.
pub fn parse_page_range(spec: &str, total_pages: u32) -> OcrResult<Vec<u32>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok((1..=total_pages).collect());
    }

    let mut pages = Vec::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => (parse_page_number(a)?, parse_page_number(b)?),
            None => {
                let n = parse_page_number(token)?;
                (n, n)
            }
        };
        if start > end {
            return Err(OcrError::InvalidInput(format!(
                "page range {token:?} is inverted"
            )));
        }
        for page in start..=end {
            if page >= 1 && page <= total_pages && !pages.contains(&page) {
                pages.push(page);
            }
        }
    }

    if pages.is_empty() {
        return Err(OcrError::InvalidInput(format!(
            "page range {spec:?} selects no pages of a {total_pages}-page document"
        )));
    }
    Ok(pages)
}

fn parse_page_number(token: &str) -> OcrResult<u32> {
    token
        .trim()
        .parse::<u32>()
        .map_err(|_| OcrError::InvalidInput(format!("invalid page number {token:?}")))
}

/// Number of pages in the document at `path`.
pub fn page_count(path: &Path) -> OcrResult<u32> {
    let pdfium = bind()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| OcrError::Pdf(e.to_string()))?;
    Ok(u32::from(document.pages().len()))
}

/// Render the selected 1-based pages at [`RENDER_DPI`].
pub fn rasterize_pages(path: &Path, pages: &[u32]) -> OcrResult<Vec<RasterizedPage>> {
    let pdfium = bind()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| OcrError::Pdf(e.to_string()))?;

    let mut rendered = Vec::with_capacity(pages.len());
    for &page_number in pages {
        let page = document
            .pages()
            .get((page_number - 1) as u16)
            .map_err(|e| OcrError::Pdf(format!("page {page_number}: {e}")))?;

        let width_pt = page.width().value;
        let height_pt = page.height().value;
        let config = PdfRenderConfig::new()
            .set_target_width((width_pt * RENDER_DPI as f32 / PDF_POINTS_PER_INCH) as i32)
            .set_target_height((height_pt * RENDER_DPI as f32 / PDF_POINTS_PER_INCH) as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| OcrError::Pdf(format!("render page {page_number}: {e}")))?;
        let image = bitmap.as_image();
        rendered.push(RasterizedPage {
            page_number,
            width: image.width(),
            height: image.height(),
            image,
        });
    }
    Ok(rendered)
}

fn bind() -> OcrResult<Pdfium> {
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| OcrError::Pdf(format!("pdfium unavailable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_selects_all_pages() {
        assert_eq!(parse_page_range("", 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_page_range("  ", 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn single_pages_and_spans_combine() {
        assert_eq!(parse_page_range("1,3-5", 10).unwrap(), vec![1, 3, 4, 5]);
        assert_eq!(parse_page_range("2-3,1", 3).unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn out_of_range_tokens_are_dropped() {
        assert_eq!(parse_page_range("1,9", 3).unwrap(), vec![1]);
        assert_eq!(parse_page_range("2-100", 4).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn fully_out_of_range_is_an_error() {
        assert!(parse_page_range("9-12", 3).is_err());
        assert!(parse_page_range("0", 3).is_err());
    }

    #[test]
    fn malformed_tokens_are_errors() {
        assert!(parse_page_range("abc", 3).is_err());
        assert!(parse_page_range("3-1", 5).is_err());
        assert!(parse_page_range("1-", 5).is_err());
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(parse_page_range("1,1,1-2", 5).unwrap(), vec![1, 2]);
    }
}
