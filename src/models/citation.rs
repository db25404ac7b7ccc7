//! A reference to a statutory section, extracted by the `extract_citations`
//! stage.

use serde::{Deserialize, Serialize};

/// Resolution status for a citation against the act-name registry. `Invalid`
/// is a terminal, retained status — the original source's scripts delete
/// resolutions it considers garbage instead of marking them invalid; this
/// implementation keeps the row and marks it `Invalid` (see DESIGN.md open
/// question resolution), since silently deleting extracted evidence is not
/// acceptable for a legal discovery tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationResolutionStatus {
    Available,
    AutoFetched,
    Missing,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: i64,
    pub document_id: String,
    pub act_name: String,
    pub section: String,
    pub subsection: Option<String>,
    pub raw_text: String,
    pub source_page: u32,
    pub source_bbox_ids: Vec<i64>,
    pub resolution_status: CitationResolutionStatus,
}

impl Citation {
    pub fn new(document_id: String, act_name: String, section: String, raw_text: String, source_page: u32) -> Self {
        Self {
            id: 0,
            document_id,
            act_name,
            section,
            subsection: None,
            raw_text,
            source_page,
            source_bbox_ids: Vec::new(),
            resolution_status: CitationResolutionStatus::Missing,
        }
    }
}

/// A structured table extracted from a page (expansion, §4.4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub id: i64,
    pub document_id: String,
    pub page_number: u32,
    pub source_bbox_ids: Vec<i64>,
    pub rows: Vec<Vec<String>>,
    pub caption: Option<String>,
}

impl ExtractedTable {
    pub fn new(document_id: String, page_number: u32, rows: Vec<Vec<String>>) -> Self {
        Self { id: 0, document_id, page_number, source_bbox_ids: Vec::new(), rows, caption: None }
    }
}
