//! Result serialization for the batch processor.
//!
//! Three formats over the same `(file, result)` pairs: plain text
//! sections, pretty JSON, and RFC-4180 CSV. Rendering is deterministic:
//! the same results always produce byte-identical output.

use serde::Serialize;

use crate::error::{OcrError, OcrResult};
use crate::types::{ImageResult, Region};

/// `file,region_index,...` header, fixed by the CSV contract.
const CSV_HEADER: [&str; 10] = [
    "file",
    "region_index",
    "text",
    "confidence",
    "det_confidence",
    "x",
    "y",
    "width",
    "height",
    "language",
];

/// Plain-text rendering: one `# <file>` section per image, regions
/// ordered top-to-bottom then left-to-right, blank line between sections.
pub fn format_text(entries: &[(&str, &ImageResult)]) -> String {
    let sections: Vec<String> = entries
        .iter()
        .map(|(file, ocr)| {
            let mut ordered: Vec<&Region> = ocr.regions.iter().collect();
            ordered.sort_by(|a, b| {
                (a.bounding_box.y, a.bounding_box.x).cmp(&(b.bounding_box.y, b.bounding_box.x))
            });
            let body = ordered
                .iter()
                .map(|r| r.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if body.is_empty() {
                format!("# {file}\n")
            } else {
                format!("# {file}\n{body}\n")
            }
        })
        .collect();
    sections.join("\n")
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    file: &'a str,
    ocr: &'a ImageResult,
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    images: Vec<JsonEntry<'a>>,
}

/// JSON rendering: `{"images":[{file, ocr}, ...]}`, two-space indent.
pub fn format_json(entries: &[(&str, &ImageResult)]) -> OcrResult<String> {
    let doc = JsonDocument {
        images: entries
            .iter()
            .map(|(file, ocr)| JsonEntry { file, ocr })
            .collect(),
    };
    serde_json::to_string_pretty(&doc)
        .map_err(|e| OcrError::InvalidInput(format!("json encoding: {e}")))
}

/// CSV rendering: one row per region; images without regions emit a
/// single zero row so every input file appears in the output.
pub fn format_csv(entries: &[(&str, &ImageResult)]) -> OcrResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| OcrError::InvalidInput(format!("csv encoding: {e}")))?;

    for (file, ocr) in entries {
        if ocr.regions.is_empty() {
            writer
                .write_record([*file, "0", "", "0.000", "0.000", "0", "0", "0", "0", ""])
                .map_err(|e| OcrError::InvalidInput(format!("csv encoding: {e}")))?;
            continue;
        }
        for (idx, region) in ocr.regions.iter().enumerate() {
            let b = &region.bounding_box;
            let index = idx.to_string();
            let rec_conf = format!("{:.3}", region.rec_confidence);
            let det_conf = format!("{:.3}", region.det_confidence);
            let (x, y) = (b.x.to_string(), b.y.to_string());
            let (w, h) = (b.width.to_string(), b.height.to_string());
            writer
                .write_record([
                    *file,
                    index.as_str(),
                    region.text.as_str(),
                    rec_conf.as_str(),
                    det_conf.as_str(),
                    x.as_str(),
                    y.as_str(),
                    w.as_str(),
                    h.as_str(),
                    region.language.as_deref().unwrap_or(""),
                ])
                .map_err(|e| OcrError::InvalidInput(format!("csv encoding: {e}")))?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| OcrError::InvalidInput(format!("csv encoding: {e}")))?;
    String::from_utf8(bytes).map_err(|e| OcrError::InvalidInput(format!("csv encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn region(text: &str, rec: f64, det: f64, x: i32, y: i32) -> Region {
        Region {
            polygon: vec![
                [x as f32, y as f32],
                [(x + 40) as f32, y as f32],
                [(x + 40) as f32, (y + 10) as f32],
                [x as f32, (y + 10) as f32],
            ],
            bounding_box: BoundingBox::new(x, y, 40, 10),
            det_confidence: det,
            text: text.into(),
            rec_confidence: rec,
            char_confidences: None,
            rotated: None,
            language: Some("en".into()),
        }
    }

    #[test]
    fn text_format_sections_and_blank_lines() {
        let r1 = ImageResult::new(100, 100, vec![region("Hello World", 0.95, 0.95, 0, 0)]);
        let r2 = ImageResult::new(100, 100, vec![region("Test Image", 0.88, 0.88, 0, 0)]);
        let out = format_text(&[("/path/image1.png", &r1), ("/path/image2.png", &r2)]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# /path/image1.png",
                "Hello World",
                "",
                "# /path/image2.png",
                "Test Image",
            ]
        );
    }

    #[test]
    fn text_format_orders_regions_top_then_left() {
        let r = ImageResult::new(
            200,
            200,
            vec![
                region("third", 0.9, 0.9, 0, 50),
                region("second", 0.9, 0.9, 100, 0),
                region("first", 0.9, 0.9, 0, 0),
            ],
        );
        let out = format_text(&[("f.png", &r)]);
        assert_eq!(out, "# f.png\nfirst\nsecond\nthird\n");
    }

    #[test]
    fn csv_keeps_three_decimal_places() {
        let r = ImageResult::new(100, 100, vec![region("word", 0.95, 0.9, 1, 2)]);
        let out = format_csv(&[("f.png", &r)]).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "file,region_index,text,confidence,det_confidence,x,y,width,height,language"
        );
        assert_eq!(lines.next().unwrap(), "f.png,0,word,0.950,0.900,1,2,40,10,en");
    }

    #[test]
    fn csv_emits_zero_row_for_empty_images() {
        let r = ImageResult::new(100, 100, vec![]);
        let out = format_csv(&[("empty.png", &r)]).unwrap();
        let row = out.lines().nth(1).unwrap();
        assert_eq!(row, "empty.png,0,,0.000,0.000,0,0,0,0,");
    }

    #[test]
    fn csv_quotes_fields_with_commas() {
        let r = ImageResult::new(100, 100, vec![region("a,b", 0.5, 0.5, 0, 0)]);
        let out = format_csv(&[("f.png", &r)]).unwrap();
        assert!(out.contains("\"a,b\""));
    }

    #[test]
    fn csv_is_deterministic() {
        let r = ImageResult::new(
            100,
            100,
            vec![region("one", 0.7, 0.6, 0, 0), region("two", 0.8, 0.9, 0, 20)],
        );
        let a = format_csv(&[("f.png", &r)]).unwrap();
        let b = format_csv(&[("f.png", &r)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_nests_results_under_images() {
        let r = ImageResult::new(10, 10, vec![]);
        let out = format_json(&[("f.png", &r)]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["images"][0]["file"], "f.png");
        assert_eq!(parsed["images"][0]["ocr"]["width"], 10);
        // Two-space indentation.
        assert!(out.contains("\n  \"images\""));
    }
}
