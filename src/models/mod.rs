//! Data models for the document intelligence pipeline.

mod bounding_box;
mod case_document;
mod citation;
mod entity_mention;
mod job;
mod matter;
mod ocr_chunk;
mod text_chunk;
mod timeline_event;

pub use bounding_box::BoundingBox;
pub use case_document::{CaseDocument, CaseDocumentStatus, OcrQualityStatus};
pub use citation::{Citation, CitationResolutionStatus, ExtractedTable};
pub use entity_mention::{EntityKind, EntityMention};
pub use job::{Job, JobMetadata, JobStatus, JobType};
pub use matter::{Matter, MatterRole};
pub use ocr_chunk::{assert_contiguous, OcrChunk, OcrChunkStatus};
pub use text_chunk::{
    ChunkType, TextChunk, CHILD_OVERLAP_RATIO, CHILD_TOKENS_MAX, CHILD_TOKENS_MIN, PARENT_TOKENS_MAX,
    PARENT_TOKENS_MIN,
};
pub use timeline_event::{ConsistencyIssue, DatePrecision, IssueSeverity, TimelineEvent};
