//! `ocr_chunk(document_id, chunk_index, page_start, page_end)` — OCR one
//! page range under a distributed chunk lock, idempotent on re-delivery.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::lock::{chunk_lock_key, ChunkLock};
use crate::models::{OcrChunk, OcrChunkStatus};

use super::{ocr_chunk_key, ChunkOcrResult, LlmProvider, ObjectStore, PipelineStore};

/// Chunk lock TTL (§3/§4.5): held for the duration of the OCR call.
pub const CHUNK_LOCK_TTL: Duration = Duration::from_secs(120);

pub struct OcrChunkArgs<'a> {
    pub document_id: &'a str,
    pub matter_id: &'a str,
    pub chunk_index: u32,
    pub page_start: u32,
    pub page_end: u32,
    pub pdf_bytes: &'a [u8],
    pub ocr_provider_name: &'a str,
}

pub enum OcrChunkOutcome {
    /// Already completed, or currently owned by another worker — idempotent
    /// no-op per §4.4's "re-reads chunk row" contract.
    AlreadyHandled,
    Completed,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    store: &dyn PipelineStore,
    objects: &dyn ObjectStore,
    provider: &dyn LlmProvider,
    lock: &dyn ChunkLock,
    args: OcrChunkArgs<'_>,
) -> Result<OcrChunkOutcome> {
    let chunks = store.get_chunks_for_document(args.document_id).await?;
    if let Some(existing) = chunks.iter().find(|c| c.chunk_index == args.chunk_index) {
        if existing.status == OcrChunkStatus::Completed {
            return Ok(OcrChunkOutcome::AlreadyHandled);
        }
    }

    let lock_key = chunk_lock_key(args.document_id, args.chunk_index);
    let Some(handle) = lock.acquire(&lock_key, CHUNK_LOCK_TTL).await? else {
        // Someone else holds the lock; this is not a failure, just a no-op
        // for this delivery. Late-ack redelivery will retry later if the
        // chunk still isn't done by then.
        return Ok(OcrChunkOutcome::AlreadyHandled);
    };

    let mut chunk = OcrChunk::new(args.document_id.to_string(), args.chunk_index, args.page_start, args.page_end);
    chunk.status = OcrChunkStatus::Processing;
    chunk.processing_started_at = Some(chrono::Utc::now());
    store.save_ocr_chunk(&chunk).await?;

    let result = run_ocr(objects, provider, &args, &mut chunk).await;

    // Persist whatever run_ocr left in `chunk` — completed fields on
    // success, status=Failed/error_message on error — regardless of which
    // branch it took. Skipping this on error would leave the row stuck at
    // `processing` forever instead of recording the failure.
    let save_result = store.save_ocr_chunk(&chunk).await;

    // Lock release is best-effort on exit paths (§4.5): expiry is the
    // authoritative safety net, so a release failure here must not fail the
    // stage.
    let _ = lock.release(&handle).await;

    result.and_then(|outcome| {
        save_result?;
        Ok(outcome)
    })
}

async fn run_ocr(
    objects: &dyn ObjectStore,
    provider: &dyn LlmProvider,
    args: &OcrChunkArgs<'_>,
    chunk: &mut OcrChunk,
) -> Result<OcrChunkOutcome> {
    let pages = match provider
        .ocr_pdf_range(args.ocr_provider_name, args.pdf_bytes, args.page_start, args.page_end)
        .await
    {
        Ok(pages) => pages,
        Err(err) => {
            chunk.status = OcrChunkStatus::Failed;
            chunk.error_message = Some(err.to_string());
            return Err(err);
        }
    };

    let chunk_result = ChunkOcrResult { document_id: args.document_id.to_string(), chunk_index: args.chunk_index, pages };
    let serialized = serde_json::to_vec(&chunk_result).map_err(|e| PipelineError::Integrity(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    let checksum = hex::encode(hasher.finalize());

    let key = ocr_chunk_key(args.matter_id, args.document_id, args.chunk_index);
    objects.put(&key, serialized).await?;

    chunk.result_storage_path = Some(key);
    chunk.result_checksum = Some(checksum);
    chunk.status = OcrChunkStatus::Completed;
    chunk.processing_completed_at = Some(chrono::Utc::now());

    Ok(OcrChunkOutcome::Completed)
}

pub fn all_chunks_terminal(chunks: &[OcrChunk]) -> bool {
    !chunks.is_empty() && chunks.iter().all(|c| c.status.is_terminal())
}

/// Thin wrapper pairing a store and lock so callers don't have to thread
/// both through every call site in the worker dispatch loop.
pub struct OcrChunkStage {
    pub store: Arc<dyn PipelineStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub lock: Arc<dyn ChunkLock>,
}

impl OcrChunkStage {
    pub async fn run(&self, args: OcrChunkArgs<'_>) -> Result<OcrChunkOutcome> {
        run(self.store.as_ref(), self.objects.as_ref(), self.provider.as_ref(), self.lock.as_ref(), args).await
    }
}
