//! Worker pool & task runner (C3): backpressure-aware dispatch of ledger
//! jobs onto a bounded pool of async tasks.
//!
//! Grounded in `services/ocr/mod.rs`'s phased processing loop (progress
//! emitted over an `mpsc` channel rather than returned only at the end) and
//! `rate_limit/redis.rs`'s backoff-with-recovery-multiplier shape,
//! generalized from HTTP 429s to any `PipelineError::RateLimit`.

pub mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{PipelineError, RetryDecision};
use crate::models::Job;

/// Default concurrent task budget. Configurable via
/// `PipelineConfig::worker_concurrency`.
pub const DEFAULT_CONCURRENCY: usize = 50;
/// A stage that runs longer than this without completing is logged as
/// overdue but not yet killed.
pub const SOFT_TIMEOUT: Duration = Duration::from_secs(3300);
/// A stage that runs longer than this is aborted and the job failed.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted { job_id: String, job_type: String },
    JobProgress { job_id: String, stage: String, progress_pct: u8 },
    JobSoftTimeout { job_id: String, elapsed: Duration },
    JobCompleted { job_id: String },
    JobFailed { job_id: String, error: String, will_retry: bool },
}

/// One pipeline stage's executable contract, as dispatched by the worker
/// pool. [`crate::pipeline`] supplies the concrete implementations; this
/// trait is the seam the pool dispatches through so tests can substitute a
/// stub stage without spinning up real OCR/LLM calls.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, job: &Job, progress: mpsc::Sender<WorkerEvent>) -> Result<(), PipelineError>;
}

/// Bounded pool of concurrent task executions. Mirrors the shape of the
/// teacher's phased OCR processing but generalizes "how many documents at
/// once" into a semaphore-gated spawn loop instead of a fixed `workers: usize`
/// passed straight to a thread pool — so capacity can be shared across job
/// types fairly rather than partitioned per phase.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    runner: Arc<dyn TaskRunner>,
}

impl WorkerPool {
    pub fn new(runner: Arc<dyn TaskRunner>, concurrency: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(concurrency)), runner }
    }

    /// Spawn one job's execution, applying retry/backoff classification on
    /// failure and soft/hard timeout enforcement. Returns immediately; the
    /// join handle resolves once the job reaches a terminal outcome for this
    /// attempt (it may still be requeued by the caller on a retryable
    /// failure).
    pub fn spawn(&self, job: Job, progress_tx: mpsc::Sender<WorkerEvent>) -> JoinHandle<JobOutcome> {
        let semaphore = self.semaphore.clone();
        let runner = self.runner.clone();

        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            matter_id = %job.matter_id,
            document_id = tracing::field::Empty,
            job_type = job.job_type.as_str(),
        );
        if let Some(doc_id) = &job.document_id {
            span.record("document_id", doc_id.as_str());
        }

        tokio::spawn(
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                run_with_timeout(&*runner, job, progress_tx).await
            }
            .instrument(span),
        )
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Retry { backoff: Duration },
    Failed { retryable: bool, error: String },
}

async fn run_with_timeout(runner: &dyn TaskRunner, job: Job, progress_tx: mpsc::Sender<WorkerEvent>) -> JobOutcome {
    let _ = progress_tx
        .send(WorkerEvent::JobStarted { job_id: job.id.clone(), job_type: job.job_type.as_str().to_string() })
        .await;

    let soft_timeout_job_id = job.id.clone();
    let soft_timeout_tx = progress_tx.clone();
    let soft_timeout_guard = tokio::spawn(async move {
        tokio::time::sleep(SOFT_TIMEOUT).await;
        let _ = soft_timeout_tx
            .send(WorkerEvent::JobSoftTimeout { job_id: soft_timeout_job_id, elapsed: SOFT_TIMEOUT })
            .await;
    });

    let result = tokio::time::timeout(HARD_TIMEOUT, runner.run(&job, progress_tx.clone())).await;
    soft_timeout_guard.abort();

    match result {
        Err(_elapsed) => {
            let error = format!("job exceeded hard timeout of {HARD_TIMEOUT:?}");
            let _ = progress_tx
                .send(WorkerEvent::JobFailed { job_id: job.id.clone(), error: error.clone(), will_retry: true })
                .await;
            JobOutcome::Retry { backoff: retry_backoff(job.retry_count) }
        }
        Ok(Ok(())) => {
            let _ = progress_tx.send(WorkerEvent::JobCompleted { job_id: job.id.clone() }).await;
            JobOutcome::Completed
        }
        Ok(Err(err)) => {
            let decision = err.classify();
            match decision {
                RetryDecision::Retry { backoff } => {
                    let _ = progress_tx
                        .send(WorkerEvent::JobFailed { job_id: job.id.clone(), error: err.to_string(), will_retry: true })
                        .await;
                    JobOutcome::Retry { backoff }
                }
                RetryDecision::Fail { retryable, .. } => {
                    let _ = progress_tx
                        .send(WorkerEvent::JobFailed { job_id: job.id.clone(), error: err.to_string(), will_retry: false })
                        .await;
                    JobOutcome::Failed { retryable, error: err.to_string() }
                }
            }
        }
    }
}

/// Exponential backoff with jitter, same shape as the adaptive rate
/// limiter's recovery-multiplier sequence: doubling, capped, randomized by
/// up to 20% so many simultaneously-failing jobs don't all wake up at once.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let base_secs = 2u64.saturating_pow(retry_count.min(8)).min(300);
    let jitter_ms = (base_secs * 1000) / 5;
    let jitter = fastrand_like_jitter(jitter_ms);
    Duration::from_millis(base_secs * 1000 + jitter)
}

/// A small deterministic-enough jitter source that avoids pulling in a
/// dedicated RNG crate for one call site; seeds off the current time's
/// subsecond component.
fn fastrand_like_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        calls: Arc<AtomicUsize>,
        fail_with: Option<PipelineError>,
    }

    #[async_trait::async_trait]
    impl TaskRunner for CountingRunner {
        async fn run(&self, _job: &Job, _progress: mpsc::Sender<WorkerEvent>) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(PipelineError::Validation(e)) => Err(PipelineError::Validation(e.clone())),
                Some(_) | None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn pool_runs_job_and_reports_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(CountingRunner { calls: calls.clone(), fail_with: None });
        let pool = WorkerPool::new(runner, 4);
        let (tx, mut rx) = mpsc::channel(16);

        let job = Job::new("job-1".into(), "matter-1".into(), None, JobType::ProcessDocument, 3);
        let handle = pool.spawn(job, tx);
        let outcome = handle.await.unwrap();

        assert!(matches!(outcome, JobOutcome::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkerEvent::JobCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn semaphore_caps_concurrency() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(CountingRunner { calls: calls.clone(), fail_with: None });
        let pool = WorkerPool::new(runner, 2);
        let (tx, _rx) = mpsc::channel(64);

        let mut handles = Vec::new();
        for i in 0..6 {
            let job = Job::new(format!("job-{i}"), "matter-1".into(), None, JobType::ProcessDocument, 3);
            handles.push(pool.spawn(job, tx.clone()));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let small = retry_backoff(0);
        let large = retry_backoff(10);
        assert!(small < large);
        assert!(large <= Duration::from_secs(300) + Duration::from_secs(60));
    }
}
