//! `PipelineTaskRunner`: the concrete [`crate::worker::TaskRunner`] that
//! dispatches a claimed [`Job`] to the right stage(s) of the C4 DAG.
//!
//! Grounded in `finalize::run`'s "raw `&rusqlite::Connection` used directly
//! inside an async fn" idiom for ledger writes, and in the data-flow
//! paragraph of SPEC_FULL §2 ("C1 inspects the PDF; for ≤threshold pages the
//! job proceeds in a single stage chain, otherwise C1 splits into N chunk
//! specs and enqueues one `process_chunk` task per chunk plus one deferred
//! `finalize` task... When all chunks reach terminal success state, C6 (or
//! the last chunk worker) triggers the merge→downstream-stages chain").
//!
//! The sync path is implemented as the chunked path with exactly one chunk
//! spanning the whole document — this reuses `ocr_chunk::run`'s idempotency
//! and locking rather than duplicating it, and lets `merge_ocr::run` (which
//! already tolerates an arbitrary chunk count) handle both paths uniformly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::cache::QueryCache;
use crate::error::{PipelineError, Result};
use crate::ledger;
use crate::lock::ChunkLock;
use crate::models::{CaseDocumentStatus, Job, JobType, OcrChunk};
use crate::realtime::{ConnectionManager, ServerMessage};
use crate::recovery;
use crate::router::{self, RouteMode};
use crate::worker::{TaskRunner, WorkerEvent};

use super::{chunk_source_key, confidence, contradictions, embed, entities, finalize, link_bboxes, ocr_chunk, tables};
use super::{chunk as chunk_stage, merge_ocr};
use super::{LlmProvider, ObjectStore, PipelineStore};

/// Deterministic job id for one document's chunk, since the ledger's `jobs`
/// table (unlike `ocr_chunks`) has no `chunk_index` column of its own.
fn chunk_job_id(document_id: &str, chunk_index: u32) -> String {
    format!("{document_id}:chunk:{chunk_index}")
}

fn parse_chunk_job_id(job_id: &str) -> Option<(String, u32)> {
    let (document_id, index_str) = job_id.rsplit_once(":chunk:")?;
    let chunk_index: u32 = index_str.parse().ok()?;
    Some((document_id.to_string(), chunk_index))
}

pub struct PipelineTaskRunner {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
    provider: Arc<dyn LlmProvider>,
    lock: Arc<dyn ChunkLock>,
    cache: Arc<dyn QueryCache>,
    connections: Arc<ConnectionManager>,
    db_path: PathBuf,
    ocr_provider: String,
    embedding_provider: String,
    extraction_provider: String,
    job_stale_timeout_minutes: i64,
}

impl PipelineTaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        provider: Arc<dyn LlmProvider>,
        lock: Arc<dyn ChunkLock>,
        cache: Arc<dyn QueryCache>,
        connections: Arc<ConnectionManager>,
        db_path: impl Into<PathBuf>,
        ocr_provider: String,
        embedding_provider: String,
        extraction_provider: String,
        job_stale_timeout_minutes: i64,
    ) -> Self {
        Self {
            store,
            objects,
            provider,
            lock,
            cache,
            connections,
            db_path: db_path.into(),
            ocr_provider,
            embedding_provider,
            extraction_provider,
            job_stale_timeout_minutes,
        }
    }

    /// Fresh connection per call, same idiom as [`crate::store::SqliteStore`]
    /// — correctness under concurrency comes from SQLite's own locking plus
    /// `ledger::with_retry`, not from a shared connection.
    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| PipelineError::Integrity(format!("failed to open ledger connection: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(|e| PipelineError::Integrity(e.to_string()))?;
        Ok(conn)
    }

    async fn emit_progress(
        &self,
        conn: &Connection,
        job_id: Option<&str>,
        matter_id: &str,
        stage: &str,
        progress_pct: u8,
        progress: &mpsc::Sender<WorkerEvent>,
    ) {
        if let Some(id) = job_id {
            if let Err(err) = ledger::heartbeat(conn, id, stage, progress_pct) {
                tracing::warn!(job_id = id, stage, error = %err, "heartbeat failed, continuing");
            }
            let _ = progress
                .send(WorkerEvent::JobProgress { job_id: id.to_string(), stage: stage.to_string(), progress_pct })
                .await;
        }

        self.connections
            .broadcast_to_matter(
                matter_id,
                &ServerMessage::JobProgress {
                    job_id: job_id.unwrap_or(matter_id).to_string(),
                    progress: progress_pct,
                    stage: stage.to_string(),
                },
            )
            .await;
    }

    /// `confidence → chunk → link_bboxes → embed → extract(parallel) →
    /// contradictions → finalize`, shared by the sync path, the last chunk
    /// worker to finish, and the `TriggerPendingMerges` sweeper. `job_id` is
    /// the ledger row to heartbeat/complete against; sweeper-triggered runs
    /// pass `None` and mint their own `finalize` job instead.
    async fn run_post_ocr_chain(
        &self,
        conn: &Connection,
        job_id: Option<&str>,
        matter_id: &str,
        document_id: &str,
        progress: &mpsc::Sender<WorkerEvent>,
    ) -> Result<()> {
        merge_ocr::run(self.store.as_ref(), self.objects.as_ref(), matter_id, document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "merge_ocr", 40, progress).await;

        confidence::run(self.store.as_ref(), document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "confidence", 50, progress).await;

        chunk_stage::run(self.store.as_ref(), document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "chunk", 60, progress).await;

        link_bboxes::run(self.store.as_ref(), document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "link_bboxes", 70, progress).await;

        embed::run(self.store.as_ref(), self.provider.as_ref(), &self.embedding_provider, document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "embed", 80, progress).await;

        let (entities_res, citations_res, events_res, tables_res) = tokio::join!(
            entities::extract_entities(self.store.as_ref(), self.provider.as_ref(), &self.extraction_provider, document_id),
            entities::extract_citations(self.store.as_ref(), self.provider.as_ref(), &self.extraction_provider, document_id),
            entities::extract_events(self.store.as_ref(), self.provider.as_ref(), &self.extraction_provider, document_id),
            tables::run(self.store.as_ref(), self.provider.as_ref(), &self.extraction_provider, document_id),
        );
        entities_res?;
        citations_res?;
        events_res?;
        tables_res?;
        self.emit_progress(conn, job_id, matter_id, "extract", 90, progress).await;

        contradictions::run(self.store.as_ref(), self.provider.as_ref(), &self.extraction_provider, document_id).await?;
        self.emit_progress(conn, job_id, matter_id, "contradictions", 95, progress).await;

        let finalize_job_id = match job_id {
            Some(id) => id.to_string(),
            None => {
                let finalize_job =
                    Job::new(format!("{document_id}:finalize"), matter_id.to_string(), Some(document_id.to_string()), JobType::Finalize, 3);
                ledger::create(conn, &finalize_job)?;
                finalize_job.id
            }
        };
        finalize::run(self.store.as_ref(), self.cache.as_ref(), self.connections.as_ref(), conn, &finalize_job_id, matter_id, document_id)
            .await?;

        Ok(())
    }

    async fn handle_process_document(&self, job: &Job, progress: &mpsc::Sender<WorkerEvent>) -> Result<()> {
        let document_id = job
            .document_id
            .clone()
            .ok_or_else(|| PipelineError::Integrity("process_document job missing document_id".into()))?;

        let mut document = self.store.get_document(&document_id).await?;
        let pdf_bytes = self.objects.get(&document.storage_path).await?;
        let route = router::decide_route(&pdf_bytes)?;

        document.page_count = Some(route.page_count);
        if document.status == CaseDocumentStatus::Pending {
            document.transition_to(CaseDocumentStatus::Processing).map_err(PipelineError::Integrity)?;
        }
        self.store.save_document(&document).await?;

        match route.mode {
            RouteMode::Sync => {
                let args = ocr_chunk::OcrChunkArgs {
                    document_id: &document_id,
                    matter_id: &job.matter_id,
                    chunk_index: 0,
                    page_start: 1,
                    page_end: route.page_count,
                    pdf_bytes: &pdf_bytes,
                    ocr_provider_name: &self.ocr_provider,
                };
                ocr_chunk::run(self.store.as_ref(), self.objects.as_ref(), self.provider.as_ref(), self.lock.as_ref(), args).await?;

                let conn = self.open_conn()?;
                self.emit_progress(&conn, Some(&job.id), &job.matter_id, "ocr", 30, progress).await;
                self.run_post_ocr_chain(&conn, Some(&job.id), &job.matter_id, &document_id, progress).await
            }
            RouteMode::Chunked => {
                let conn = self.open_conn()?;

                let existing = self.store.get_chunks_for_document(&document_id).await?;
                let existing_indices: std::collections::HashSet<u32> = existing.iter().map(|c| c.chunk_index).collect();

                let parts = router::split(&pdf_bytes, &route.specs)?;
                for (spec, bytes) in route.specs.iter().zip(parts.into_iter()) {
                    if existing_indices.contains(&spec.chunk_index) {
                        continue;
                    }

                    let key = chunk_source_key(&job.matter_id, &document_id, spec.chunk_index);
                    self.objects.put(&key, bytes).await?;

                    let chunk_row = OcrChunk::new(document_id.clone(), spec.chunk_index, spec.page_start, spec.page_end);
                    self.store.save_ocr_chunk(&chunk_row).await?;

                    let chunk_job = Job::new(
                        chunk_job_id(&document_id, spec.chunk_index),
                        job.matter_id.clone(),
                        Some(document_id.clone()),
                        JobType::ProcessChunk,
                        job.max_retries,
                    );
                    ledger::create(&conn, &chunk_job)?;
                }

                // This job's own work (routing + fan-out) is done; the rest
                // of the DAG runs under the process_chunk jobs just queued.
                ledger::complete(&conn, &job.id)?;
                Ok(())
            }
        }
    }

    async fn handle_process_chunk(&self, job: &Job, progress: &mpsc::Sender<WorkerEvent>) -> Result<()> {
        let (document_id, chunk_index) = parse_chunk_job_id(&job.id)
            .ok_or_else(|| PipelineError::Integrity(format!("malformed process_chunk job id: {}", job.id)))?;

        let chunks = self.store.get_chunks_for_document(&document_id).await?;
        let spec = chunks
            .iter()
            .find(|c| c.chunk_index == chunk_index)
            .ok_or_else(|| PipelineError::Integrity(format!("no chunk row for {document_id}:{chunk_index}")))?;
        let (page_start, page_end) = (spec.page_start, spec.page_end);

        let key = chunk_source_key(&job.matter_id, &document_id, chunk_index);
        let pdf_bytes = self.objects.get(&key).await?;

        let args = ocr_chunk::OcrChunkArgs {
            document_id: &document_id,
            matter_id: &job.matter_id,
            chunk_index,
            page_start,
            page_end,
            pdf_bytes: &pdf_bytes,
            ocr_provider_name: &self.ocr_provider,
        };
        ocr_chunk::run(self.store.as_ref(), self.objects.as_ref(), self.provider.as_ref(), self.lock.as_ref(), args).await?;

        let conn = self.open_conn()?;
        ledger::complete(&conn, &job.id)?;

        let chunks = self.store.get_chunks_for_document(&document_id).await?;
        let completed = chunks.iter().filter(|c| c.status.is_terminal()).count();
        self.emit_progress(
            &conn,
            None,
            &job.matter_id,
            "ocr_chunk",
            ((completed * 30) / chunks.len().max(1)) as u8,
            progress,
        )
        .await;

        if ocr_chunk::all_chunks_terminal(&chunks) {
            self.run_post_ocr_chain(&conn, None, &job.matter_id, &document_id, progress).await?;
        }

        Ok(())
    }

    async fn handle_finalize(&self, job: &Job) -> Result<()> {
        let document_id =
            job.document_id.clone().ok_or_else(|| PipelineError::Integrity("finalize job missing document_id".into()))?;
        let conn = self.open_conn()?;
        finalize::run(self.store.as_ref(), self.cache.as_ref(), self.connections.as_ref(), &conn, &job.id, &job.matter_id, &document_id)
            .await
    }

    async fn handle_recover_stale_jobs(&self) -> Result<()> {
        let conn = self.open_conn()?;
        let recovered = recovery::recover_stale_jobs(&conn, Utc::now(), self.job_stale_timeout_minutes)?;
        if recovered > 0 {
            tracing::info!(recovered, "stale jobs recovered");
        }
        Ok(())
    }

    async fn handle_recover_stale_chunks(&self) -> Result<()> {
        let conn = self.open_conn()?;
        let stale = recovery::find_stale_chunks(&conn, Utc::now())?;

        for (document_id, chunk_index) in stale {
            recovery::reset_chunk_to_pending(&conn, &document_id, chunk_index)?;

            let document = self.store.get_document(&document_id).await?;
            let retry_job = Job::new(chunk_job_id(&document_id, chunk_index), document.matter_id, Some(document_id), JobType::ProcessChunk, 3);
            ledger::create(&conn, &retry_job)?;
        }

        Ok(())
    }

    async fn handle_trigger_pending_merges(&self, progress: &mpsc::Sender<WorkerEvent>) -> Result<()> {
        let conn = self.open_conn()?;
        let ready = recovery::find_documents_ready_to_merge(&conn)?;

        for document_id in ready {
            let document = self.store.get_document(&document_id).await?;
            self.run_post_ocr_chain(&conn, None, &document.matter_id, &document_id, progress).await?;
        }

        Ok(())
    }

    async fn handle_cleanup_stale_chunks(&self) -> Result<()> {
        let conn = self.open_conn()?;
        let past_retention = recovery::find_chunks_past_retention(&conn, Utc::now())?;

        let mut by_document: std::collections::HashMap<String, Vec<u32>> = std::collections::HashMap::new();
        for (document_id, chunk_index) in past_retention {
            by_document.entry(document_id).or_default().push(chunk_index);
        }

        for (document_id, indices) in by_document {
            let chunks = self.store.get_chunks_for_document(&document_id).await?;
            for chunk_index in indices {
                if let Some(chunk) = chunks.iter().find(|c| c.chunk_index == chunk_index) {
                    if let Some(path) = &chunk.result_storage_path {
                        if let Err(err) = self.objects.delete(path).await {
                            tracing::warn!(document_id, chunk_index, error = %err, "failed to delete retained chunk blob, continuing");
                        }
                    }
                }
                recovery::delete_chunk_row(&conn, &document_id, chunk_index)?;
            }
        }

        Ok(())
    }

    async fn handle_dispatch_stuck_queued_jobs(&self) -> Result<()> {
        let conn = self.open_conn()?;
        let stuck = recovery::find_stuck_queued_jobs(&conn, Utc::now())?;

        for job_id in stuck {
            // No broker redelivery mechanism exists in this build (§1
            // treats the broker as out of scope beyond the ledger itself);
            // bumping `updated_at` is what makes the row visible again to
            // the next `claim_batch` sweep of the dispatch loop.
            ledger::heartbeat(&conn, &job_id, "dispatch_stuck_queued_jobs", 0)?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskRunner for PipelineTaskRunner {
    async fn run(&self, job: &Job, progress: mpsc::Sender<WorkerEvent>) -> std::result::Result<(), PipelineError> {
        match job.job_type {
            JobType::ProcessDocument => self.handle_process_document(job, &progress).await,
            JobType::ProcessChunk => self.handle_process_chunk(job, &progress).await,
            JobType::Finalize => self.handle_finalize(job).await,
            JobType::RecoverStaleJobs => self.handle_recover_stale_jobs().await,
            JobType::RecoverStaleChunks => self.handle_recover_stale_chunks().await,
            JobType::TriggerPendingMerges => self.handle_trigger_pending_merges(&progress).await,
            JobType::CleanupStaleChunks => self.handle_cleanup_stale_chunks().await,
            JobType::DispatchStuckQueuedJobs => self.handle_dispatch_stuck_queued_jobs().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_job_id_round_trips() {
        let id = chunk_job_id("doc-1", 4);
        assert_eq!(parse_chunk_job_id(&id), Some(("doc-1".to_string(), 4)));
    }

    #[test]
    fn parse_rejects_malformed_job_id() {
        assert_eq!(parse_chunk_job_id("doc-1"), None);
        assert_eq!(parse_chunk_job_id("doc-1:chunk:not-a-number"), None);
    }

    #[test]
    fn document_id_containing_the_separator_still_round_trips_via_rsplit() {
        // rsplit_once takes the *last* occurrence, so a document id that
        // itself contains ":chunk:" (unlikely, but ids are opaque strings)
        // still parses correctly as long as the index suffix is numeric.
        let id = chunk_job_id("doc:chunk:weird", 2);
        assert_eq!(parse_chunk_job_id(&id), Some(("doc:chunk:weird".to_string(), 2)));
    }
}
