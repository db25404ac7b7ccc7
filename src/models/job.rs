//! The job ledger's row type. See [`crate::ledger`] for the operations that
//! mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ProcessDocument,
    ProcessChunk,
    Finalize,
    RecoverStaleJobs,
    RecoverStaleChunks,
    TriggerPendingMerges,
    CleanupStaleChunks,
    DispatchStuckQueuedJobs,
}

impl JobType {
    /// Each task declares a queue; see §4.3.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::ProcessDocument | Self::ProcessChunk | Self::Finalize => "default",
            Self::RecoverStaleJobs
            | Self::RecoverStaleChunks
            | Self::TriggerPendingMerges
            | Self::CleanupStaleChunks
            | Self::DispatchStuckQueuedJobs => "low",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessDocument => "process_document",
            Self::ProcessChunk => "process_chunk",
            Self::Finalize => "finalize",
            Self::RecoverStaleJobs => "recover_stale_jobs",
            Self::RecoverStaleChunks => "recover_stale_chunks",
            Self::TriggerPendingMerges => "trigger_pending_merges",
            Self::CleanupStaleChunks => "cleanup_stale_chunks",
            Self::DispatchStuckQueuedJobs => "dispatch_stuck_queued_jobs",
        }
    }
}

/// Reshaped per §9's "Dynamic typing and free-form config maps" design note:
/// a tagged variant instead of a dict-shaped metadata blob, so callers can't
/// silently drop fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobMetadata {
    Processing { stage: String, attempt: u32 },
    Recovering { previous_error: String, attempt: u32 },
    ChunkProcessing { chunk_count: u32, completed_chunks: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub matter_id: String,
    pub document_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub progress_pct: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub task_handle: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: Option<JobMetadata>,
}

impl Job {
    pub fn new(id: String, matter_id: String, document_id: Option<String>, job_type: JobType, max_retries: u32) -> Self {
        Self {
            id,
            matter_id,
            document_id,
            job_type,
            status: JobStatus::Queued,
            current_stage: None,
            completed_stages: Vec::new(),
            progress_pct: 0,
            retry_count: 0,
            max_retries,
            task_handle: None,
            started_at: None,
            updated_at: Utc::now(),
            error_message: None,
            metadata: None,
        }
    }
}
