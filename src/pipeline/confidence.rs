//! `confidence(document_id)` — aggregate per-word/per-page OCR confidences
//! into a document-level score and quality status. Pure function of
//! already-persisted bounding boxes; safely retryable.

use crate::error::Result;
use crate::models::{BoundingBox, OcrQualityStatus};

use super::PipelineStore;

/// Average confidence per page, in page order.
pub fn per_page_averages(boxes: &[BoundingBox]) -> Vec<(u32, f32)> {
    let mut by_page: std::collections::BTreeMap<u32, (f32, u32)> = std::collections::BTreeMap::new();
    for bbox in boxes {
        let entry = by_page.entry(bbox.page_number).or_insert((0.0, 0));
        entry.0 += bbox.ocr_confidence;
        entry.1 += 1;
    }
    by_page
        .into_iter()
        .map(|(page, (sum, count))| (page, if count > 0 { sum / count as f32 } else { 0.0 }))
        .collect()
}

/// Document-level average: the mean of the per-page averages, not a raw
/// mean of all boxes — so a page with many low-confidence words doesn't
/// dominate a document with few pages.
pub fn document_average(boxes: &[BoundingBox]) -> f32 {
    let pages = per_page_averages(boxes);
    if pages.is_empty() {
        return 0.0;
    }
    pages.iter().map(|(_, avg)| avg).sum::<f32>() / pages.len() as f32
}

pub async fn run(store: &dyn PipelineStore, document_id: &str) -> Result<(f32, OcrQualityStatus)> {
    let boxes = store.get_bounding_boxes(document_id).await?;
    let avg = document_average(&boxes);
    let quality = OcrQualityStatus::from_confidence(avg as f64);

    let mut document = store.get_document(document_id).await?;
    document.ocr_confidence = Some(avg as f64);
    document.ocr_quality_status = Some(quality);
    store.save_document(&document).await?;

    Ok((avg, quality))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    fn bbox(page: u32, confidence: f32) -> BoundingBox {
        BoundingBox::new("doc-1".into(), page, 0.0, 0.0, 0.1, 0.1, "text".into(), confidence)
    }

    #[test]
    fn averages_per_page_then_across_pages() {
        let boxes = vec![bbox(1, 0.9), bbox(1, 0.7), bbox(2, 0.5)];
        // page 1 avg = 0.8, page 2 avg = 0.5, doc avg = 0.65
        let avg = document_average(&boxes);
        assert!((avg - 0.65).abs() < 1e-6);
    }

    #[test]
    fn empty_boxes_yield_zero() {
        assert_eq!(document_average(&[]), 0.0);
    }
}
