//! Sweep scheduler (C6): enqueues one singleton ledger job per sweep type on
//! its own cadence, rather than running sweep logic inline on a timer
//! outside the ledger. Each tick just inserts/refreshes a row; the dispatch
//! loop's normal `claim_batch` polling is what actually runs it, the same
//! way any other low-priority job gets worked.
//!
//! Grounded in `original_source/backend/app/services/chunk_recovery_service.py`'s
//! periodic-task shape, adapted from "a bare asyncio loop calling the
//! service directly" to "enqueue through the ledger" so a sweep's execution
//! gets the same retry/heartbeat/stale-recovery guarantees as any other job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::watch;

use crate::ledger;
use crate::models::{Job, JobType};

use super::{
    CLEANUP_SWEEP_INTERVAL, PENDING_MERGE_SWEEP_INTERVAL, STALE_CHUNK_SWEEP_INTERVAL, STALE_JOB_SWEEP_INTERVAL,
    STUCK_QUEUED_SWEEP_INTERVAL,
};

/// `matter_id` recorded on sweep jobs, which have no real tenant.
pub const SYSTEM_MATTER_ID: &str = "__system__";

fn sweep_job_id(job_type: JobType) -> String {
    format!("sweep:{}", job_type.as_str())
}

/// Ensures exactly one non-terminal job exists for `job_type`. If the
/// previous tick's job is still queued or processing, this is a no-op (the
/// sweep is already pending or running); if it reached a terminal state,
/// the old row is deleted and a fresh one created so `retry_count` resets
/// every tick instead of accumulating toward `max_retries` forever.
fn enqueue_sweep(conn: &Connection, job_type: JobType) -> ledger::Result<()> {
    let id = sweep_job_id(job_type);

    match ledger::get(conn, &id) {
        Ok(existing) if !existing.status.is_terminal() => Ok(()),
        Ok(_) => {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            ledger::create(conn, &Job::new(id, SYSTEM_MATTER_ID.to_string(), None, job_type, 1))?;
            Ok(())
        }
        Err(ledger::LedgerError::NotFound(_)) => {
            ledger::create(conn, &Job::new(id, SYSTEM_MATTER_ID.to_string(), None, job_type, 1))?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn tick_once(db_path: &Path, job_type: JobType) -> ledger::Result<()> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    enqueue_sweep(&conn, job_type)
}

/// Spawns one ticker per sweep cadence and runs until `shutdown` reports
/// `true`. Each ticker is independent, so a slow sweep-job backlog on one
/// cadence never delays another's scheduling.
pub async fn run_forever(db_path: PathBuf, shutdown: watch::Receiver<bool>) {
    let sweeps: [(JobType, Duration); 5] = [
        (JobType::RecoverStaleJobs, STALE_JOB_SWEEP_INTERVAL),
        (JobType::RecoverStaleChunks, STALE_CHUNK_SWEEP_INTERVAL),
        (JobType::TriggerPendingMerges, PENDING_MERGE_SWEEP_INTERVAL),
        (JobType::CleanupStaleChunks, CLEANUP_SWEEP_INTERVAL),
        (JobType::DispatchStuckQueuedJobs, STUCK_QUEUED_SWEEP_INTERVAL),
    ];

    let mut handles = Vec::with_capacity(sweeps.len());
    for (job_type, interval) in sweeps {
        let db_path = db_path.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it so sweeps don't all fire at process start
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = tick_once(&db_path, job_type) {
                            tracing::error!(job_type = job_type.as_str(), error = %err, "sweep enqueue failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    let mut shutdown = shutdown;
    let _ = shutdown.changed().await;
    for handle in handles {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let store = crate::store::SqliteStore::new(&db_path);
        store.init_schema().unwrap();
        (dir, db_path)
    }

    #[test]
    fn enqueue_sweep_creates_job_when_none_exists() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        enqueue_sweep(&conn, JobType::RecoverStaleJobs).unwrap();

        let job = ledger::get(&conn, &sweep_job_id(JobType::RecoverStaleJobs)).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.matter_id, SYSTEM_MATTER_ID);
    }

    #[test]
    fn enqueue_sweep_is_a_no_op_while_previous_job_is_pending() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        enqueue_sweep(&conn, JobType::RecoverStaleJobs).unwrap();
        let first = ledger::get(&conn, &sweep_job_id(JobType::RecoverStaleJobs)).unwrap();

        enqueue_sweep(&conn, JobType::RecoverStaleJobs).unwrap();
        let second = ledger::get(&conn, &sweep_job_id(JobType::RecoverStaleJobs)).unwrap();

        assert_eq!(first.updated_at, second.updated_at);
    }

    #[test]
    fn enqueue_sweep_replaces_terminal_job_with_a_fresh_one() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        enqueue_sweep(&conn, JobType::RecoverStaleJobs).unwrap();
        ledger::complete(&conn, &sweep_job_id(JobType::RecoverStaleJobs)).unwrap();

        enqueue_sweep(&conn, JobType::RecoverStaleJobs).unwrap();

        let job = ledger::get(&conn, &sweep_job_id(JobType::RecoverStaleJobs)).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
    }
}
