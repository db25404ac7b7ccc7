//! A contiguous page range of a [`crate::models::CaseDocument`] being OCR'd
//! independently. See router::split for how page ranges are computed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OcrChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrChunk {
    pub document_id: String,
    /// 0-based, unique per document.
    pub chunk_index: u32,
    /// 1-based inclusive.
    pub page_start: u32,
    /// 1-based inclusive.
    pub page_end: u32,
    pub status: OcrChunkStatus,
    pub result_storage_path: Option<String>,
    pub result_checksum: Option<String>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    /// Number of times this chunk has been reset to pending by a recovery
    /// sweeper. A plain counter column, not parsed out of `error_message`
    /// (see DESIGN.md's resolution of the corresponding open question).
    pub recovery_attempts: u32,
}

impl OcrChunk {
    pub fn new(document_id: String, chunk_index: u32, page_start: u32, page_end: u32) -> Self {
        Self {
            document_id,
            chunk_index,
            page_start,
            page_end,
            status: OcrChunkStatus::Pending,
            result_storage_path: None,
            result_checksum: None,
            error_message: None,
            processing_started_at: None,
            processing_completed_at: None,
            recovery_attempts: 0,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_end - self.page_start + 1
    }
}

/// Verify that a set of chunks forms a gapless, non-overlapping partition of
/// `[1..=page_count]` with chunk_index forming `[0..N)`. Used by `merge_ocr`
/// before concatenating chunk text, and as a standalone invariant check in
/// tests (§8: "Σ(chunk.page_end − chunk.page_start + 1) ... = D.page_count").
pub fn assert_contiguous(chunks: &[OcrChunk], page_count: u32) -> Result<(), String> {
    let mut sorted: Vec<&OcrChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.chunk_index);

    for (expected_index, chunk) in sorted.iter().enumerate() {
        if chunk.chunk_index != expected_index as u32 {
            return Err(format!(
                "chunk_index gap: expected {expected_index}, found {}",
                chunk.chunk_index
            ));
        }
    }

    let mut expected_start = 1u32;
    for chunk in &sorted {
        if chunk.page_start != expected_start {
            return Err(format!(
                "page range gap at chunk {}: expected start {expected_start}, found {}",
                chunk.chunk_index, chunk.page_start
            ));
        }
        expected_start = chunk.page_end + 1;
    }

    if expected_start != page_count + 1 {
        return Err(format!(
            "chunks cover pages 1..{} but document has {page_count} pages",
            expected_start - 1
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, start: u32, end: u32) -> OcrChunk {
        OcrChunk::new("doc".into(), index, start, end)
    }

    #[test]
    fn contiguous_partition_passes() {
        let chunks = vec![chunk(0, 1, 15), chunk(1, 16, 30), chunk(2, 31, 50)];
        assert!(assert_contiguous(&chunks, 50).is_ok());
    }

    #[test]
    fn gap_in_page_ranges_fails() {
        let chunks = vec![chunk(0, 1, 15), chunk(1, 17, 30)];
        assert!(assert_contiguous(&chunks, 30).is_err());
    }

    #[test]
    fn missing_chunk_index_fails() {
        let chunks = vec![chunk(0, 1, 15), chunk(2, 16, 30)];
        assert!(assert_contiguous(&chunks, 30).is_err());
    }

    #[test]
    fn undercount_fails() {
        let chunks = vec![chunk(0, 1, 15)];
        assert!(assert_contiguous(&chunks, 30).is_err());
    }
}
