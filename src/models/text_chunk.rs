//! The retrieval unit produced by the `chunk` stage: a parent/child text
//! segmentation of a document's merged OCR text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Parent,
    Child,
}

/// Token-count targets from the spec's chunk invariants.
pub const PARENT_TOKENS_MIN: u32 = 1500;
pub const PARENT_TOKENS_MAX: u32 = 2000;
pub const CHILD_TOKENS_MIN: u32 = 400;
pub const CHILD_TOKENS_MAX: u32 = 700;
/// Overlap between adjacent child chunks, as a fraction of child size.
pub const CHILD_OVERLAP_RATIO: f32 = 0.14;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: i64,
    pub document_id: String,
    pub parent_chunk_id: Option<i64>,
    pub chunk_type: ChunkType,
    pub chunk_index: u32,
    pub content: String,
    pub token_count: u32,
    /// Derived by `link_bboxes`; `None` until that stage runs.
    pub page_number: Option<u32>,
    pub bbox_ids: Vec<i64>,
    /// Present only once `embed` has run.
    pub embedding: Option<Vec<f32>>,
}

impl TextChunk {
    pub fn new_parent(document_id: String, chunk_index: u32, content: String, token_count: u32) -> Self {
        Self {
            id: 0,
            document_id,
            parent_chunk_id: None,
            chunk_type: ChunkType::Parent,
            chunk_index,
            content,
            token_count,
            page_number: None,
            bbox_ids: Vec::new(),
            embedding: None,
        }
    }

    pub fn new_child(
        document_id: String,
        parent_chunk_id: i64,
        chunk_index: u32,
        content: String,
        token_count: u32,
    ) -> Self {
        Self {
            id: 0,
            document_id,
            parent_chunk_id: Some(parent_chunk_id),
            chunk_type: ChunkType::Child,
            chunk_index,
            content,
            token_count,
            page_number: None,
            bbox_ids: Vec::new(),
            embedding: None,
        }
    }

    pub fn is_below_min_size(&self) -> bool {
        match self.chunk_type {
            ChunkType::Parent => self.token_count < PARENT_TOKENS_MIN,
            ChunkType::Child => self.token_count < CHILD_TOKENS_MIN,
        }
    }
}
