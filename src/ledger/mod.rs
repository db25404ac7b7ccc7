//! Job Ledger (C2): durable job records with atomic claim semantics.
//!
//! Grounded in `repository/crawl/claim.rs`'s `BEGIN IMMEDIATE` claim pattern
//! and `repository/mod.rs`'s `with_retry` busy-retry wrapper — both carried
//! over unchanged in spirit, generalized from crawl URLs to pipeline jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::models::{Job, JobMetadata, JobStatus, JobType};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {0} is not in a claimable state")]
    NotClaimable(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Same busy-retry policy as the teacher's `repository::with_retry`: five
/// attempts, doubling backoff starting at 100ms, triggered on SQLite's
/// locked/busy errors.
pub fn with_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay_ms = 100u64;
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(LedgerError::Database(e)) if attempt < 4 && is_locked(&e) => {
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms = (delay_ms * 2).min(1600);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_locked(e: &rusqlite::Error) -> bool {
    let msg = e.to_string();
    msg.contains("database is locked") || msg.contains("SQLITE_BUSY") || msg.contains("SQLITE_LOCKED")
}

/// Enqueue a new job in `queued` status. Idempotent on `id`: an existing row
/// with the same id is left untouched and its current state returned,
/// matching the at-least-once-enqueue contract in §5.
pub fn create(conn: &Connection, job: &Job) -> Result<Job> {
    with_retry(|| {
        let metadata_json = job.metadata.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO jobs (id, matter_id, document_id, job_type, status, current_stage,
                completed_stages, progress_pct, retry_count, max_retries, task_handle,
                started_at, updated_at, error_message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO NOTHING",
            params![
                job.id,
                job.matter_id,
                job.document_id,
                job.job_type.as_str(),
                job.status.as_str(),
                job.current_stage,
                serde_json::to_string(&job.completed_stages)?,
                job.progress_pct,
                job.retry_count,
                job.max_retries,
                job.task_handle,
                job.started_at.map(|t| t.to_rfc3339()),
                job.updated_at.to_rfc3339(),
                job.error_message,
                metadata_json,
            ],
        )?;
        get(conn, &job.id)
    })
}

pub fn get(conn: &Connection, job_id: &str) -> Result<Job> {
    with_retry(|| {
        conn.query_row(
            "SELECT id, matter_id, document_id, job_type, status, current_stage, completed_stages,
                progress_pct, retry_count, max_retries, task_handle, started_at, updated_at,
                error_message, metadata
             FROM jobs WHERE id = ?1",
            params![job_id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))
    })
}

/// Atomically transition a queued job to `processing`, recording a worker
/// handle. Uses `BEGIN IMMEDIATE` so two workers racing the same job can
/// never both win the claim — the same guarantee `claim_pending_url` gives
/// crawl URLs.
pub fn claim(conn: &mut Connection, job_id: &str, task_handle: &str) -> Result<Option<Job>> {
    with_retry(|| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let current_status: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![job_id], |r| r.get(0))
            .optional()?;

        let Some(status) = current_status else {
            tx.rollback()?;
            return Ok(None);
        };

        if status != JobStatus::Queued.as_str() {
            tx.rollback()?;
            return Ok(None);
        }

        let now = Utc::now().to_rfc3339();
        let updated = tx.execute(
            "UPDATE jobs SET status = ?1, task_handle = ?2, started_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![JobStatus::Processing.as_str(), task_handle, now, job_id, JobStatus::Queued.as_str()],
        )?;

        if updated == 0 {
            tx.rollback()?;
            return Ok(None);
        }

        let job = tx.query_row(
            "SELECT id, matter_id, document_id, job_type, status, current_stage, completed_stages,
                progress_pct, retry_count, max_retries, task_handle, started_at, updated_at,
                error_message, metadata
             FROM jobs WHERE id = ?1",
            params![job_id],
            row_to_job,
        )?;

        tx.commit()?;
        Ok(Some(job))
    })
}

/// Claim up to `limit` queued jobs from `queue`'s job types in FIFO order.
/// Grounds the worker pool's batch-dequeue loop, mirroring
/// `claim_pending_urls`'s batch variant of the single-row claim.
pub fn claim_batch(conn: &mut Connection, queue: &str, task_handle: &str, limit: u32) -> Result<Vec<Job>> {
    with_retry(|| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let queue_types: Vec<&'static str> = [
            JobType::ProcessDocument,
            JobType::ProcessChunk,
            JobType::Finalize,
            JobType::RecoverStaleJobs,
            JobType::RecoverStaleChunks,
            JobType::TriggerPendingMerges,
            JobType::CleanupStaleChunks,
            JobType::DispatchStuckQueuedJobs,
        ]
        .into_iter()
        .filter(|t| t.queue() == queue)
        .map(|t| t.as_str())
        .collect();

        if queue_types.is_empty() {
            tx.rollback()?;
            return Ok(Vec::new());
        }

        let placeholders = queue_types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let ids: Vec<String> = {
            let sql = format!(
                "SELECT id FROM jobs WHERE status = ? AND job_type IN ({placeholders}) ORDER BY updated_at ASC LIMIT ?"
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut param_values: Vec<&dyn rusqlite::ToSql> = vec![&JobStatus::Queued.as_str() as &dyn rusqlite::ToSql];
            for t in &queue_types {
                param_values.push(t);
            }
            let limit_i64 = limit as i64;
            param_values.push(&limit_i64);
            let rows = stmt.query_map(param_values.as_slice(), |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let now = Utc::now().to_rfc3339();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let updated = tx.execute(
                "UPDATE jobs SET status = ?1, task_handle = ?2, started_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![JobStatus::Processing.as_str(), task_handle, now, id, JobStatus::Queued.as_str()],
            )?;
            if updated == 1 {
                let job = tx.query_row(
                    "SELECT id, matter_id, document_id, job_type, status, current_stage, completed_stages,
                        progress_pct, retry_count, max_retries, task_handle, started_at, updated_at,
                        error_message, metadata
                     FROM jobs WHERE id = ?1",
                    params![id],
                    row_to_job,
                )?;
                claimed.push(job);
            }
        }

        tx.commit()?;
        Ok(claimed)
    })
}

/// Update `current_stage`/`progress_pct` and bump `updated_at`, which also
/// serves as the heartbeat the stale-job sweeper checks against.
pub fn heartbeat(conn: &Connection, job_id: &str, stage: &str, progress_pct: u8) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "UPDATE jobs SET current_stage = ?1, progress_pct = ?2, updated_at = ?3 WHERE id = ?4",
            params![stage, progress_pct, Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    })
}

pub fn mark_stage_completed(conn: &Connection, job_id: &str, stage: &str) -> Result<()> {
    with_retry(|| {
        let job = get(conn, job_id)?;
        let mut stages = job.completed_stages;
        if !stages.iter().any(|s| s == stage) {
            stages.push(stage.to_string());
        }
        conn.execute(
            "UPDATE jobs SET completed_stages = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&stages)?, Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    })
}

pub fn complete(conn: &Connection, job_id: &str) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "UPDATE jobs SET status = ?1, progress_pct = 100, updated_at = ?2 WHERE id = ?3",
            params![JobStatus::Completed.as_str(), Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    })
}

/// Mark a job failed. If `retry_count < max_retries`, requeues it instead of
/// terminating — the at-least-once redelivery contract in §5.
pub fn fail(conn: &Connection, job_id: &str, error_message: &str) -> Result<JobStatus> {
    with_retry(|| {
        let job = get(conn, job_id)?;
        let now = Utc::now().to_rfc3339();
        let next_status = if job.retry_count + 1 < job.max_retries {
            JobStatus::Queued
        } else {
            JobStatus::Failed
        };
        conn.execute(
            "UPDATE jobs SET status = ?1, retry_count = retry_count + 1, error_message = ?2,
                task_handle = NULL, updated_at = ?3
             WHERE id = ?4",
            params![next_status.as_str(), error_message, now, job_id],
        )?;
        Ok(next_status)
    })
}

pub fn set_metadata(conn: &Connection, job_id: &str, metadata: &JobMetadata) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "UPDATE jobs SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(metadata)?, Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    })
}

/// Jobs stuck in `processing` whose `updated_at` is older than
/// `stale_timeout_minutes` (SPEC_FULL §6 `job_stale_timeout_minutes`,
/// default 30) — the input to `recover_stale_jobs`.
pub fn find_stale(conn: &Connection, now: DateTime<Utc>, stale_timeout_minutes: i64) -> Result<Vec<Job>> {
    with_retry(|| {
        let cutoff = (now - chrono::Duration::minutes(stale_timeout_minutes)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, matter_id, document_id, job_type, status, current_stage, completed_stages,
                progress_pct, retry_count, max_retries, task_handle, started_at, updated_at,
                error_message, metadata
             FROM jobs WHERE status = ?1 AND updated_at < ?2",
        )?;
        let rows = stmt.query_map(params![JobStatus::Processing.as_str(), cutoff], row_to_job)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(LedgerError::from)
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let job_type_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let completed_stages_json: String = row.get(6)?;
    let started_at_str: Option<String> = row.get(11)?;
    let updated_at_str: String = row.get(12)?;
    let metadata_json: Option<String> = row.get(14)?;

    Ok(Job {
        id: row.get(0)?,
        matter_id: row.get(1)?,
        document_id: row.get(2)?,
        job_type: job_type_from_str(&job_type_str),
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed),
        current_stage: row.get(5)?,
        completed_stages: serde_json::from_str(&completed_stages_json).unwrap_or_default(),
        progress_pct: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        task_handle: row.get(10)?,
        started_at: started_at_str.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        error_message: row.get(13)?,
        metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn job_type_from_str(s: &str) -> JobType {
    match s {
        "process_document" => JobType::ProcessDocument,
        "process_chunk" => JobType::ProcessChunk,
        "finalize" => JobType::Finalize,
        "recover_stale_jobs" => JobType::RecoverStaleJobs,
        "recover_stale_chunks" => JobType::RecoverStaleChunks,
        "trigger_pending_merges" => JobType::TriggerPendingMerges,
        "cleanup_stale_chunks" => JobType::CleanupStaleChunks,
        _ => JobType::DispatchStuckQueuedJobs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY, matter_id TEXT, document_id TEXT, job_type TEXT, status TEXT,
                current_stage TEXT, completed_stages TEXT, progress_pct INTEGER, retry_count INTEGER,
                max_retries INTEGER, task_handle TEXT, started_at TEXT, updated_at TEXT,
                error_message TEXT, metadata TEXT
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn create_is_idempotent_on_id() {
        let conn = setup();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        create(&conn, &job).unwrap();
        create(&conn, &job).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn claim_transitions_queued_to_processing_once() {
        let mut conn = setup();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        create(&conn, &job).unwrap();

        let first = claim(&mut conn, "job-1", "worker-a").unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, JobStatus::Processing);

        let second = claim(&mut conn, "job-1", "worker-b").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn fail_requeues_under_max_retries_and_terminates_at_limit() {
        let conn = setup();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 2);
        create(&conn, &job).unwrap();

        let status = fail(&conn, "job-1", "transient error").unwrap();
        assert_eq!(status, JobStatus::Queued);

        let status = fail(&conn, "job-1", "transient error again").unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn find_stale_returns_only_processing_past_timeout() {
        let conn = setup();
        let mut job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now() - chrono::Duration::hours(1);
        create(&conn, &job).unwrap();

        let stale = find_stale(&conn, Utc::now(), 30).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "job-1");
    }
}
