//! Recovery & sweepers (C6): periodic jobs that find work stuck in
//! non-terminal states past a timeout and either requeue or terminally
//! fail it.
//!
//! Grounded in `original_source/backend/app/services/chunk_recovery_service.py`
//! and `merge_trigger_service.py`; determinism note from §4.6: sweepers are
//! safe to run concurrently across processes because they coordinate only
//! through the ledger's atomic status transitions — a sweeper that loses
//! the race to transition `processing → queued` simply moves on.

pub mod scheduler;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::ledger;
use crate::models::{JobStatus, JobType, OcrChunkStatus};

/// Sweep cadences (§4.6), exposed as constants so a scheduler loop can refer
/// to them without magic durations scattered through call sites.
pub const STALE_JOB_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);
pub const STALE_CHUNK_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
pub const PENDING_MERGE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(120);
pub const CLEANUP_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);
pub const STUCK_QUEUED_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

pub const JOB_STALE_TIMEOUT_MINUTES: i64 = 30;
pub const CHUNK_STALE_TIMEOUT_MINUTES: i64 = 5;
pub const JOB_MAX_RECOVERY_RETRIES: u32 = 3;
pub const STUCK_QUEUED_THRESHOLD_MINUTES: i64 = 10;
pub const CLEANUP_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub jobs_recovered: u32,
    pub chunks_recovered: u32,
    pub merges_triggered: u32,
    pub jobs_dispatched: u32,
    pub chunks_cleaned: u32,
}

/// Finds Jobs with status=processing past `job_stale_timeout` and either
/// requeues (bumping retry_count) or marks them permanently failed at
/// `job_max_recovery_retries`.
pub fn recover_stale_jobs(conn: &Connection, now: DateTime<Utc>, job_stale_timeout_minutes: i64) -> Result<u32> {
    let stale = ledger::find_stale(conn, now, job_stale_timeout_minutes)?;
    let mut recovered = 0;

    for job in stale {
        if job.retry_count < JOB_MAX_RECOVERY_RETRIES {
            ledger::fail(conn, &job.id, "worker_timeout_recovery")?;
            recovered += 1;
        } else {
            ledger::fail(conn, &job.id, "worker_timeout")?;
        }
    }

    Ok(recovered)
}

/// Same pattern as `recover_stale_jobs` but scoped to `OCRChunks`, with a
/// finer-grained timeout, re-dispatching the `ocr_chunk` task for each
/// reset chunk.
pub fn find_stale_chunks(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<(String, u32)>> {
    let cutoff = (now - chrono::Duration::minutes(CHUNK_STALE_TIMEOUT_MINUTES)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT document_id, chunk_index FROM ocr_chunks WHERE status = ?1 AND processing_started_at < ?2",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![OcrChunkStatus::Processing.as_str(), cutoff],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)),
    )?;
    rows.collect()
}

pub fn reset_chunk_to_pending(conn: &Connection, document_id: &str, chunk_index: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE ocr_chunks SET status = ?1, recovery_attempts = recovery_attempts + 1,
            processing_started_at = NULL, error_message = NULL
         WHERE document_id = ?2 AND chunk_index = ?3",
        rusqlite::params![OcrChunkStatus::Pending.as_str(), document_id, chunk_index],
    )?;
    Ok(())
}

/// Finds Documents whose chunks are all completed but whose status is still
/// `processing` — the window between "last chunk completed" and "merge
/// enqueued" where a crash could otherwise strand the document forever.
pub fn find_documents_ready_to_merge(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT d.id FROM documents d
         WHERE d.status = 'processing'
           AND EXISTS (SELECT 1 FROM ocr_chunks c WHERE c.document_id = d.id)
           AND NOT EXISTS (
                SELECT 1 FROM ocr_chunks c WHERE c.document_id = d.id AND c.status != 'completed'
           )",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// Deletes OCRChunk rows (and, via the caller, their OS blobs) for
/// Documents past the retention window whose processing is done.
pub fn find_chunks_past_retention(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<(String, u32)>> {
    let cutoff = (now - chrono::Duration::hours(CLEANUP_RETENTION_HOURS)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT c.document_id, c.chunk_index FROM ocr_chunks c
         JOIN documents d ON d.id = c.document_id
         WHERE d.status IN ('completed', 'ocr_complete') AND d.uploaded_at < ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![cutoff], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
    rows.collect()
}

/// Finds queued Jobs older than `stuck_queued_threshold` with no
/// `task_handle` — created but never actually dispatched to a worker, e.g.
/// a broker publish that silently dropped.
pub fn find_stuck_queued_jobs(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Vec<String>> {
    let cutoff = (now - chrono::Duration::minutes(STUCK_QUEUED_THRESHOLD_MINUTES)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id FROM jobs WHERE status = ?1 AND task_handle IS NULL AND updated_at < ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![JobStatus::Queued.as_str(), cutoff], |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// Deletes one `OCRChunk` row past its retention window, after the caller
/// has removed its OS blob (if any). Split from `find_chunks_past_retention`
/// so the object-store delete and the row delete can be attempted
/// independently — a dangling row with no blob is harmless, a blob with no
/// row would leak storage forever.
pub fn delete_chunk_row(conn: &Connection, document_id: &str, chunk_index: u32) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM ocr_chunks WHERE document_id = ?1 AND chunk_index = ?2",
        rusqlite::params![document_id, chunk_index],
    )?;
    Ok(())
}

pub fn queue_depth_by_priority(conn: &Connection) -> rusqlite::Result<(u64, u64, u64)> {
    let count_for = |types: &[JobType]| -> rusqlite::Result<u64> {
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT COUNT(*) FROM jobs WHERE status = ? AND job_type IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&"queued" as &dyn rusqlite::ToSql];
        let type_strs: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        for t in &type_strs {
            params.push(t);
        }
        stmt.query_row(params.as_slice(), |r| r.get(0))
    };

    let default_types = [JobType::ProcessDocument, JobType::ProcessChunk, JobType::Finalize];
    let low_types = [
        JobType::RecoverStaleJobs,
        JobType::RecoverStaleChunks,
        JobType::TriggerPendingMerges,
        JobType::CleanupStaleChunks,
        JobType::DispatchStuckQueuedJobs,
    ];

    let default_depth = count_for(&default_types)?;
    let low_depth = count_for(&low_types)?;
    Ok((0, default_depth, low_depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Job;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY, matter_id TEXT, document_id TEXT, job_type TEXT, status TEXT,
                current_stage TEXT, completed_stages TEXT, progress_pct INTEGER, retry_count INTEGER,
                max_retries INTEGER, task_handle TEXT, started_at TEXT, updated_at TEXT,
                error_message TEXT, metadata TEXT
            );
            CREATE TABLE ocr_chunks (
                document_id TEXT, chunk_index INTEGER, page_start INTEGER, page_end INTEGER,
                status TEXT, result_storage_path TEXT, result_checksum TEXT, error_message TEXT,
                processing_started_at TEXT, processing_completed_at TEXT, recovery_attempts INTEGER
            );
            CREATE TABLE documents (
                id TEXT PRIMARY KEY, matter_id TEXT, status TEXT, uploaded_at TEXT
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn recover_stale_jobs_requeues_under_retry_limit() {
        let conn = setup();
        let mut job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 5);
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now() - chrono::Duration::hours(1);
        ledger::create(&conn, &job).unwrap();

        let recovered = recover_stale_jobs(&conn, Utc::now(), JOB_STALE_TIMEOUT_MINUTES).unwrap();
        assert_eq!(recovered, 1);

        let refreshed = ledger::get(&conn, "job-1").unwrap();
        assert_eq!(refreshed.status, JobStatus::Queued);
    }

    #[test]
    fn find_documents_ready_to_merge_requires_all_chunks_completed() {
        let conn = setup();
        conn.execute(
            "INSERT INTO documents (id, matter_id, status, uploaded_at) VALUES ('doc-1', 'm1', 'processing', ?1)",
            rusqlite::params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO ocr_chunks (document_id, chunk_index, page_start, page_end, status, recovery_attempts)
             VALUES ('doc-1', 0, 1, 10, 'completed', 0), ('doc-1', 1, 11, 20, 'completed', 0);",
        )
        .unwrap();

        let ready = find_documents_ready_to_merge(&conn).unwrap();
        assert_eq!(ready, vec!["doc-1".to_string()]);
    }

    #[test]
    fn document_with_incomplete_chunk_is_not_ready() {
        let conn = setup();
        conn.execute(
            "INSERT INTO documents (id, matter_id, status, uploaded_at) VALUES ('doc-1', 'm1', 'processing', ?1)",
            rusqlite::params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO ocr_chunks (document_id, chunk_index, page_start, page_end, status, recovery_attempts)
             VALUES ('doc-1', 0, 1, 10, 'completed', 0), ('doc-1', 1, 11, 20, 'processing', 0);",
        )
        .unwrap();

        assert!(find_documents_ready_to_merge(&conn).unwrap().is_empty());
    }
}
