//! Dispatch loop (C3): continuously claims queued jobs across queues in
//! priority order, hands them to the [`super::WorkerPool`], and resolves
//! each [`super::JobOutcome`] back into the ledger once the job's task
//! finishes.
//!
//! The pool itself only classifies outcomes (`run_with_timeout` in
//! `super`); something else has to act on the classification. This plays
//! that role, the same split the teacher draws between its scraper workers
//! (which return a per-URL result) and `repository::claim_pending_urls`
//! (which owns what happens to the row next).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, watch};

use crate::ledger;
use crate::models::Job;

use super::{JobOutcome, WorkerEvent, WorkerPool};

/// Queues polled in priority order, highest first. No [`crate::models::JobType`]
/// currently maps to `"high"` (see DESIGN.md); it's polled anyway so future
/// job types can opt into it without this loop changing.
pub const QUEUES: [&str; 3] = ["high", "default", "low"];

/// Jobs claimed per queue per poll. Bounds how long a single `claim_batch`
/// transaction holds the ledger's `BEGIN IMMEDIATE` lock.
const CLAIM_BATCH_SIZE: u32 = 16;

/// How long to sleep after a poll claims nothing, before polling again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs until `shutdown` reports `true`, claiming and dispatching jobs the
/// whole time. Intended to be spawned once per worker process alongside
/// [`crate::recovery::scheduler::run_forever`].
pub async fn run_dispatch_loop(
    db_path: PathBuf,
    pool: Arc<WorkerPool>,
    task_handle: String,
    progress_tx: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let claimed = match claim_next_batch(&db_path, &task_handle) {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(error = %err, "dispatch loop failed to claim jobs, backing off");
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        for job in claimed {
            let job_id = job.id.clone();
            let pool = pool.clone();
            let db_path = db_path.clone();
            let progress_tx = progress_tx.clone();

            tokio::spawn(async move {
                let handle = pool.spawn(job, progress_tx);
                match handle.await {
                    Ok(outcome) => resolve_outcome(&db_path, &job_id, outcome).await,
                    Err(join_err) => {
                        tracing::error!(job_id, error = %join_err, "job task panicked before resolving");
                    }
                }
            });
        }
    }
}

/// Tries each queue in priority order, returning the first non-empty batch.
/// A `"high"`-priority poll finding nothing falls through to `"default"`,
/// then `"low"` — so low-priority sweep jobs never starve out a backlog of
/// real document work, but also never wait forever behind one either once
/// the higher queues are empty.
fn claim_next_batch(db_path: &Path, task_handle: &str) -> ledger::Result<Vec<Job>> {
    let mut conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;

    for queue in QUEUES {
        let claimed = ledger::claim_batch(&mut conn, queue, task_handle, CLAIM_BATCH_SIZE)?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }
    }
    Ok(Vec::new())
}

/// Writes a claimed job's terminal-for-this-attempt outcome back to the
/// ledger. Several [`super::TaskRunner`] handlers (the sweep job types, plus
/// `finalize` via `finalize::run`) already call [`ledger::complete`] or
/// [`ledger::fail`] themselves against their own job id before returning
/// `Ok(())` — calling it again here is a harmless idempotent overwrite, and
/// it's the only path that resolves the handlers that don't self-report
/// (the sweep types dispatched straight from `claim_batch`).
async fn resolve_outcome(db_path: &Path, job_id: &str, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Completed => {
            if let Err(err) = with_conn(db_path, |conn| ledger::complete(conn, job_id)) {
                tracing::error!(job_id, error = %err, "failed to mark job completed");
            }
        }
        JobOutcome::Failed { error, .. } => {
            if let Err(err) = with_conn(db_path, |conn| ledger::fail(conn, job_id, &error)) {
                tracing::error!(job_id, error = %err, "failed to mark job failed");
            }
        }
        JobOutcome::Retry { backoff } => {
            let db_path = db_path.to_path_buf();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if let Err(err) = with_conn(&db_path, |conn| ledger::fail(conn, &job_id, "retrying after backoff")) {
                    tracing::error!(job_id, error = %err, "failed to requeue job after backoff");
                }
            });
        }
    }
}

fn with_conn<T>(db_path: &Path, f: impl FnOnce(&Connection) -> ledger::Result<T>) -> ledger::Result<T> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    f(&conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobType;
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let store = crate::store::SqliteStore::new(&db_path);
        store.init_schema().unwrap();
        (dir, db_path)
    }

    #[test]
    fn claim_next_batch_prefers_higher_priority_queue() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::RecoverStaleJobs, 3);
        ledger::create(&conn, &job).unwrap();

        let claimed = claim_next_batch(&db_path, "worker-a").unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "job-1");
    }

    #[test]
    fn claim_next_batch_returns_empty_when_nothing_queued() {
        let (_dir, db_path) = setup_db();
        let claimed = claim_next_batch(&db_path, "worker-a").unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn resolve_outcome_completed_marks_job_completed() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        ledger::create(&conn, &job).unwrap();
        ledger::claim(&mut Connection::open(&db_path).unwrap(), "job-1", "worker-a").unwrap();

        resolve_outcome(&db_path, "job-1", JobOutcome::Completed).await;

        let refreshed = ledger::get(&conn, "job-1").unwrap();
        assert_eq!(refreshed.status, crate::models::JobStatus::Completed);
    }

    #[tokio::test]
    async fn resolve_outcome_failed_requeues_under_retry_limit() {
        let (_dir, db_path) = setup_db();
        let conn = Connection::open(&db_path).unwrap();
        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        ledger::create(&conn, &job).unwrap();

        resolve_outcome(&db_path, "job-1", JobOutcome::Failed { retryable: true, error: "boom".into() }).await;

        let refreshed = ledger::get(&conn, "job-1").unwrap();
        assert_eq!(refreshed.status, crate::models::JobStatus::Queued);
        assert_eq!(refreshed.retry_count, 1);
    }
}
