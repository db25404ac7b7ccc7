//! The uploaded-PDF model that drives the processing pipeline.
//!
//! Named `CaseDocument` rather than `Document` since the latter is too
//! generic a name to carry across a data model this central.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`CaseDocument`]. Transitions are monotonic except
/// `Failed -> Pending` on recovery (§3 of the design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseDocumentStatus {
    Pending,
    Processing,
    OcrComplete,
    OcrFailed,
    Completed,
    Failed,
}

impl CaseDocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::OcrComplete => "ocr_complete",
            Self::OcrFailed => "ocr_failed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "ocr_complete" => Some(Self::OcrComplete),
            "ocr_failed" => Some(Self::OcrFailed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Recovery is the sole allowed backwards transition.
    pub fn can_transition_to(&self, next: CaseDocumentStatus) -> bool {
        if *self == CaseDocumentStatus::Failed && next == CaseDocumentStatus::Pending {
            return true;
        }
        use CaseDocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, OcrComplete)
                | (Processing, OcrFailed)
                | (Processing, Failed)
                | (OcrComplete, Processing)
                | (OcrComplete, Completed)
                | (OcrComplete, Failed)
        )
    }
}

/// Quality bucket derived from `ocr_confidence` by the `confidence` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrQualityStatus {
    Good,
    Fair,
    Poor,
}

impl OcrQualityStatus {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.85 {
            Self::Good
        } else if confidence >= 0.70 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDocument {
    pub id: String,
    pub matter_id: String,
    pub filename: String,
    /// Object-store key; see [`crate::object_store`].
    pub storage_path: String,
    pub byte_size: u64,
    pub page_count: Option<u32>,
    pub status: CaseDocumentStatus,
    pub ocr_confidence: Option<f64>,
    pub ocr_quality_status: Option<OcrQualityStatus>,
    pub extracted_text: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl CaseDocument {
    pub fn new(id: String, matter_id: String, filename: String, storage_path: String, byte_size: u64) -> Self {
        Self {
            id,
            matter_id,
            filename,
            storage_path,
            byte_size,
            page_count: None,
            status: CaseDocumentStatus::Pending,
            ocr_confidence: None,
            ocr_quality_status: None,
            extracted_text: None,
            uploaded_at: Utc::now(),
        }
    }

    /// Apply a status transition, returning an error describing the illegal
    /// jump rather than silently clobbering it. Pure/in-memory; callers
    /// persist separately (mirrors the ledger's own CAS discipline).
    pub fn transition_to(&mut self, next: CaseDocumentStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "illegal document transition {:?} -> {:?}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_thresholds_match_spec() {
        assert_eq!(OcrQualityStatus::from_confidence(0.95), OcrQualityStatus::Good);
        assert_eq!(OcrQualityStatus::from_confidence(0.85), OcrQualityStatus::Good);
        assert_eq!(OcrQualityStatus::from_confidence(0.84), OcrQualityStatus::Fair);
        assert_eq!(OcrQualityStatus::from_confidence(0.70), OcrQualityStatus::Fair);
        assert_eq!(OcrQualityStatus::from_confidence(0.69), OcrQualityStatus::Poor);
    }

    #[test]
    fn failed_can_recover_to_pending_only() {
        assert!(CaseDocumentStatus::Failed.can_transition_to(CaseDocumentStatus::Pending));
        assert!(!CaseDocumentStatus::Completed.can_transition_to(CaseDocumentStatus::Pending));
    }

    #[test]
    fn forward_transitions_are_monotonic() {
        let mut doc = CaseDocument::new(
            "d1".into(),
            "m1".into(),
            "file.pdf".into(),
            "documents/m1/uploads/file.pdf".into(),
            1024,
        );
        assert!(doc.transition_to(CaseDocumentStatus::Processing).is_ok());
        assert!(doc.transition_to(CaseDocumentStatus::OcrComplete).is_ok());
        assert!(doc.transition_to(CaseDocumentStatus::Completed).is_ok());
        assert!(doc.transition_to(CaseDocumentStatus::Pending).is_err());
    }
}
