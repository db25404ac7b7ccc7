//! Router & Chunker (C1): decide sync vs. chunked OCR and split a PDF into
//! page-range specs.
//!
//! Grounded in `original_source/backend/app/services/pdf_router.py`; the
//! page-count/routing thresholds and edge cases below are carried over
//! verbatim, reimplemented against [`lopdf`] instead of pypdf.

use lopdf::{Document as LopdfDocument, ObjectId};
use thiserror::Error;

/// Above this page count, route to the chunked path (configurable via
/// `pdf_chunk_threshold_pages`, see `config::PipelineConfig`).
pub const PAGE_COUNT_THRESHOLD: u32 = 15;
/// Hard ceiling on page count. Above this a document is rejected outright
/// rather than routed — a defense against a crafted page tree claiming an
/// enormous or malicious page count.
pub const MAX_PAGE_COUNT: u32 = 10_000;
/// Default pages per OCR call / chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 15;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("document has no pages")]
    EmptyDocument,
    #[error("document has {0} pages, exceeding the maximum of {MAX_PAGE_COUNT}")]
    OversizePdf(u32),
    #[error("not a valid PDF: missing %PDF- header")]
    MissingMagicBytes,
    #[error("failed to parse PDF: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Sync,
    Chunked,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub mode: RouteMode,
    pub page_count: u32,
    pub specs: Vec<ChunkSpec>,
}

/// One OCR call's worth of pages. 1-based, inclusive, matching `OcrChunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub chunk_index: u32,
    pub page_start: u32,
    pub page_end: u32,
}

/// Validate the `%PDF-` magic prefix before attempting to parse. Mirrors the
/// original's up-front magic-byte check so a non-PDF upload fails fast with
/// a specific error instead of surfacing an opaque parser panic/error.
fn validate_magic_bytes(pdf_bytes: &[u8]) -> Result<()> {
    if pdf_bytes.len() < 5 || &pdf_bytes[0..5] != b"%PDF-" {
        return Err(RouterError::MissingMagicBytes);
    }
    Ok(())
}

fn load_document(pdf_bytes: &[u8]) -> Result<LopdfDocument> {
    validate_magic_bytes(pdf_bytes)?;
    LopdfDocument::load_mem(pdf_bytes).map_err(|e| RouterError::ParseError(e.to_string()))
}

/// Ordered page object IDs in document reading order.
fn page_ids_in_order(doc: &LopdfDocument) -> Vec<ObjectId> {
    // `get_pages` returns a BTreeMap<page_number, ObjectId> already ordered
    // by 1-based page number, which is reading order for a well-formed PDF.
    doc.get_pages().into_values().collect()
}

/// Count pages, validating magic bytes and spot-checking the first and last
/// page objects resolve before trusting a reported count — the same defense
/// the original router applies against a page tree that claims more pages
/// than actually exist.
pub fn count_pages(pdf_bytes: &[u8]) -> Result<u32> {
    let doc = load_document(pdf_bytes)?;
    let page_ids = page_ids_in_order(&doc);
    let count = page_ids.len() as u32;

    if count == 0 {
        return Err(RouterError::EmptyDocument);
    }
    if count > MAX_PAGE_COUNT {
        return Err(RouterError::OversizePdf(count));
    }

    // Spot-check: the first and last page objects must actually resolve.
    // A page tree lying about its Count would fail this even if the
    // reported length looked plausible.
    if doc.get_object(page_ids[0]).is_err() || doc.get_object(*page_ids.last().unwrap()).is_err() {
        return Err(RouterError::ParseError(
            "page tree references unresolvable page objects".into(),
        ));
    }

    Ok(count)
}

/// Decide sync vs. chunked processing for a PDF.
pub fn decide_route(pdf_bytes: &[u8]) -> Result<RouteDecision> {
    decide_route_with_threshold(pdf_bytes, PAGE_COUNT_THRESHOLD, DEFAULT_CHUNK_SIZE)
}

pub fn decide_route_with_threshold(pdf_bytes: &[u8], threshold: u32, chunk_size: u32) -> Result<RouteDecision> {
    let page_count = count_pages(pdf_bytes)?;

    if page_count <= threshold {
        return Ok(RouteDecision {
            mode: RouteMode::Sync,
            page_count,
            specs: Vec::new(),
        });
    }

    let specs = calculate_chunk_specs(page_count, chunk_size);
    Ok(RouteDecision {
        mode: RouteMode::Chunked,
        page_count,
        specs,
    })
}

/// Partition `[1..=page_count]` into chunk specs of at most `chunk_size`
/// pages each. Pure and total — callers that already know the page count
/// (e.g. recovery sweepers re-deriving specs) can call this directly without
/// re-parsing the PDF.
pub fn calculate_chunk_specs(page_count: u32, chunk_size: u32) -> Vec<ChunkSpec> {
    let mut specs = Vec::new();
    let mut page_start = 1u32;
    let mut chunk_index = 0u32;

    while page_start <= page_count {
        let page_end = (page_start + chunk_size - 1).min(page_count);
        specs.push(ChunkSpec {
            chunk_index,
            page_start,
            page_end,
        });
        page_start = page_end + 1;
        chunk_index += 1;
    }

    specs
}

/// Split a PDF's bytes into one standalone, valid PDF per chunk spec.
///
/// Builds each output by copying only the referenced page objects and their
/// dependency graph into a fresh `lopdf::Document`, rather than re-encoding
/// the whole source document once per chunk — the spec requires streaming
/// splitting so a 10,000-page document is never fully duplicated N times.
pub fn split(pdf_bytes: &[u8], specs: &[ChunkSpec]) -> Result<Vec<Vec<u8>>> {
    let doc = load_document(pdf_bytes)?;
    let page_ids = page_ids_in_order(&doc);

    let mut outputs = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut chunk_doc = doc.clone();
        let start = (spec.page_start - 1) as usize;
        let end = (spec.page_end - 1) as usize;
        let keep: Vec<ObjectId> = page_ids
            .get(start..=end)
            .ok_or_else(|| RouterError::ParseError("chunk spec out of page range".into()))?
            .to_vec();

        chunk_doc.delete_pages(
            &page_ids
                .iter()
                .filter(|id| !keep.contains(id))
                .copied()
                .collect::<Vec<_>>(),
        );
        chunk_doc.prune_objects();

        let mut out = Vec::new();
        chunk_doc
            .save_to(&mut out)
            .map_err(|e| RouterError::ParseError(e.to_string()))?;
        outputs.push(out);
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_specs_partition_75_pages_into_3_chunks_of_25() {
        let specs = calculate_chunk_specs(75, 25);
        assert_eq!(
            specs,
            vec![
                ChunkSpec { chunk_index: 0, page_start: 1, page_end: 25 },
                ChunkSpec { chunk_index: 1, page_start: 26, page_end: 50 },
                ChunkSpec { chunk_index: 2, page_start: 51, page_end: 75 },
            ]
        );
    }

    #[test]
    fn chunk_specs_handle_remainder() {
        let specs = calculate_chunk_specs(50, 15);
        assert_eq!(
            specs,
            vec![
                ChunkSpec { chunk_index: 0, page_start: 1, page_end: 15 },
                ChunkSpec { chunk_index: 1, page_start: 16, page_end: 30 },
                ChunkSpec { chunk_index: 2, page_start: 31, page_end: 45 },
                ChunkSpec { chunk_index: 3, page_start: 46, page_end: 50 },
            ]
        );
    }

    #[test]
    fn chunk_specs_single_page() {
        assert_eq!(
            calculate_chunk_specs(1, 15),
            vec![ChunkSpec { chunk_index: 0, page_start: 1, page_end: 1 }]
        );
    }

    #[test]
    fn threshold_plus_one_yields_expected_chunk_count() {
        let specs = calculate_chunk_specs(PAGE_COUNT_THRESHOLD + 1, DEFAULT_CHUNK_SIZE);
        let expected = (PAGE_COUNT_THRESHOLD + 1).div_ceil(DEFAULT_CHUNK_SIZE);
        assert_eq!(specs.len() as u32, expected);
    }

    #[test]
    fn missing_magic_bytes_is_rejected() {
        let err = count_pages(b"not a pdf").unwrap_err();
        assert!(matches!(err, RouterError::MissingMagicBytes));
    }

    #[test]
    fn empty_bytes_is_rejected_before_parse() {
        let err = count_pages(b"").unwrap_err();
        assert!(matches!(err, RouterError::MissingMagicBytes));
    }
}
