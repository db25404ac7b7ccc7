//! `merge_ocr(document_id)` — fetch per-chunk OCR results in chunk_index
//! order, concatenate with a page-boundary marker, merge bounding boxes,
//! and transition the document to `ocr_complete`.
//!
//! MUST verify chunks partition the page range contiguously before merging
//! (§4.4); a mismatch is a fatal `Integrity` error requiring operator
//! intervention, never a silent best-effort merge.

use crate::error::{PipelineError, Result};
use crate::models::{assert_contiguous, CaseDocumentStatus};

use super::{ocr_chunk_key, ChunkOcrResult, ObjectStore, PipelineStore};

/// Marker inserted between concatenated chunk texts so page boundaries
/// remain locatable in the merged text.
pub const PAGE_BOUNDARY_MARKER: &str = "\n\n--- page boundary ---\n\n";

pub async fn run(store: &dyn PipelineStore, objects: &dyn ObjectStore, matter_id: &str, document_id: &str) -> Result<String> {
    let document = store.get_document(document_id).await?;
    let mut chunks = store.get_chunks_for_document(document_id).await?;
    chunks.sort_by_key(|c| c.chunk_index);

    if let Some(page_count) = document.page_count {
        assert_contiguous(&chunks, page_count).map_err(PipelineError::Integrity)?;
    }

    let mut merged_text = String::new();
    let mut all_boxes = Vec::new();

    for (i, chunk) in chunks.iter().enumerate() {
        let key = chunk
            .result_storage_path
            .clone()
            .unwrap_or_else(|| ocr_chunk_key(matter_id, document_id, chunk.chunk_index));
        let bytes = objects.get(&key).await?;
        let result: ChunkOcrResult = serde_json::from_slice(&bytes).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        if i > 0 {
            merged_text.push_str(PAGE_BOUNDARY_MARKER);
        }

        for page in result.pages {
            merged_text.push_str(&page.text);
            all_boxes.extend(page.boxes);
        }
    }

    let saved_boxes = store.save_bounding_boxes(document_id, &all_boxes).await?;

    let mut document = document;
    document.extracted_text = Some(merged_text.clone());
    document
        .transition_to(CaseDocumentStatus::OcrComplete)
        .map_err(PipelineError::Integrity)?;
    store.save_document(&document).await?;

    let _ = saved_boxes;
    Ok(merged_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_marker_count_matches_chunk_count_minus_one() {
        let text = format!("a{PAGE_BOUNDARY_MARKER}b{PAGE_BOUNDARY_MARKER}c");
        assert_eq!(text.matches(PAGE_BOUNDARY_MARKER).count(), 2);
    }
}
