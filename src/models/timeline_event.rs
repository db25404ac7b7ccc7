//! A dated occurrence extracted from document text by the `extract_events`
//! stage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePrecision {
    Day,
    Month,
    Year,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub document_id: String,
    /// ISO-8601 date string at the granularity given by `precision`; kept as
    /// a string rather than a `chrono::NaiveDate` because month/year-only
    /// precision can't always be zero-filled to a valid calendar date.
    pub event_date: String,
    pub precision: DatePrecision,
    pub event_date_text: String,
    pub description: String,
    pub event_type: String,
    pub source_page: u32,
    pub source_bbox_ids: Vec<i64>,
    pub entities_involved: Vec<String>,
}

impl TimelineEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        event_date: String,
        precision: DatePrecision,
        event_date_text: String,
        description: String,
        event_type: String,
        source_page: u32,
    ) -> Self {
        Self {
            id: 0,
            document_id,
            event_date,
            precision,
            event_date_text,
            description,
            event_type,
            source_page,
            source_bbox_ids: Vec::new(),
            entities_involved: Vec::new(),
        }
    }
}

/// A detected contradiction between two timeline events (expansion, §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub id: i64,
    pub document_id: String,
    pub event_a_id: i64,
    pub event_b_id: i64,
    pub description: String,
    pub severity: IssueSeverity,
}

impl ConsistencyIssue {
    pub fn new(document_id: String, event_a_id: i64, event_b_id: i64, description: String, severity: IssueSeverity) -> Self {
        Self { id: 0, document_id, event_a_id, event_b_id, description, severity }
    }
}
