//! Pipeline Stages (C4): the OCR → confidence → chunk → link_bboxes → embed →
//! extract → finalize DAG.
//!
//! Each stage is grounded in a corresponding `services/` module in the
//! teacher or an `original_source` service of the same name (named per
//! submodule below). Stages are idempotent functions over injected store/
//! provider trait objects rather than methods on a god object, matching the
//! "explicit dependencies injected at construction time" design note.

pub mod chunk;
pub mod confidence;
pub mod contradictions;
pub mod embed;
pub mod entities;
pub mod extract_shared;
pub mod finalize;
pub mod link_bboxes;
pub mod merge_ocr;
pub mod ocr_chunk;
pub mod runner;
pub mod tables;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    BoundingBox, CaseDocument, Citation, ConsistencyIssue, EntityMention, ExtractedTable, OcrChunk, TextChunk,
    TimelineEvent,
};

/// Object store (OS): opaque byte blobs, matter/document/chunk-keyed. The
/// relational/object store itself is out of scope (§1); this is the seam
/// the pipeline calls through.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Object-store key builders (§6 expansion). One pure function per key
/// shape, analogous in spirit (not shape — these are not hash-sharded) to
/// `storage::content_storage_path`.
pub fn upload_key(matter_id: &str, unique_filename: &str) -> String {
    format!("documents/{matter_id}/uploads/{unique_filename}")
}

pub fn ocr_chunk_key(matter_id: &str, document_id: &str, chunk_index: u32) -> String {
    format!("documents/{matter_id}/ocr_chunks/{document_id}/{chunk_index}.json.gz")
}

pub fn export_key(matter_id: &str, filename: &str) -> String {
    format!("documents/{matter_id}/exports/{filename}")
}

/// One chunk's split-out source PDF, written by the chunked-path dispatch so
/// the `process_chunk` job that OCRs it doesn't need to re-split the whole
/// document.
pub fn chunk_source_key(matter_id: &str, document_id: &str, chunk_index: u32) -> String {
    format!("documents/{matter_id}/chunk_sources/{document_id}/{chunk_index}.pdf")
}

/// One page's OCR output, as persisted to [`ObjectStore`] by `ocr_chunk` and
/// read back by `merge_ocr`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PageOcrResult {
    pub page_number: u32,
    pub text: String,
    pub confidence: f32,
    pub boxes: Vec<BoundingBox>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChunkOcrResult {
    pub document_id: String,
    pub chunk_index: u32,
    pub pages: Vec<PageOcrResult>,
}

/// LLM provider pool (LP): opaque async RPC with rate limits, per §1. The
/// pipeline depends on this narrow surface; the concrete providers
/// (OCR/embedding/chat) are out of scope.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn ocr_pdf_range(&self, provider: &str, pdf_bytes: &[u8], page_start: u32, page_end: u32) -> Result<Vec<PageOcrResult>>;
    async fn embed_batch(&self, provider: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn extract_structured(&self, provider: &str, prompt: &str, context: &str) -> Result<String>;
}

/// Read/write surface onto the metadata store (MS) that pipeline stages
/// need. The MS itself (transactional KV+SQL, tenant-filtered) is out of
/// scope per §1; this trait is narrowed to exactly the operations the DAG
/// calls, so a test double can implement it without a real database.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<CaseDocument>;
    async fn save_document(&self, document: &CaseDocument) -> Result<()>;

    async fn get_chunks_for_document(&self, document_id: &str) -> Result<Vec<OcrChunk>>;
    async fn save_ocr_chunk(&self, chunk: &OcrChunk) -> Result<()>;

    async fn save_bounding_boxes(&self, document_id: &str, boxes: &[BoundingBox]) -> Result<Vec<BoundingBox>>;
    async fn get_bounding_boxes(&self, document_id: &str) -> Result<Vec<BoundingBox>>;

    async fn text_chunks_exist(&self, document_id: &str) -> Result<bool>;
    async fn save_text_chunks(&self, document_id: &str, chunks: &[TextChunk]) -> Result<()>;
    async fn get_text_chunks(&self, document_id: &str) -> Result<Vec<TextChunk>>;
    async fn update_text_chunk(&self, chunk: &TextChunk) -> Result<()>;

    async fn save_entity_mentions(&self, document_id: &str, mentions: &[EntityMention]) -> Result<()>;
    async fn save_citations(&self, document_id: &str, citations: &[Citation]) -> Result<()>;
    async fn save_events(&self, document_id: &str, events: &[TimelineEvent]) -> Result<()>;
    async fn get_events(&self, document_id: &str) -> Result<Vec<TimelineEvent>>;
    async fn save_consistency_issues(&self, document_id: &str, issues: &[ConsistencyIssue]) -> Result<()>;
    async fn save_tables(&self, document_id: &str, tables: &[ExtractedTable]) -> Result<()>;
}
