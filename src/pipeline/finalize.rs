//! `finalize(document_id, matter_id)` — mark the document completed, update
//! job progress, broadcast `document_ready`, and invalidate the matter's
//! query cache.
//!
//! Per §7, errors in ancillary writes (cache invalidation, realtime
//! broadcast) must not fail the pipeline — they're logged and swallowed so
//! a Redis hiccup at the very last stage doesn't strand an otherwise-done
//! document in `processing`.

use crate::cache::QueryCache;
use crate::error::Result;
use crate::ledger;
use crate::models::CaseDocumentStatus;
use crate::realtime::{ConnectionManager, ServerMessage};

use super::PipelineStore;

pub async fn run(
    store: &dyn PipelineStore,
    cache: &dyn QueryCache,
    connections: &ConnectionManager,
    conn: &rusqlite::Connection,
    job_id: &str,
    matter_id: &str,
    document_id: &str,
) -> Result<()> {
    let mut document = store.get_document(document_id).await?;
    document
        .transition_to(CaseDocumentStatus::Completed)
        .map_err(crate::error::PipelineError::Integrity)?;
    store.save_document(&document).await?;

    ledger::complete(conn, job_id)?;

    if let Err(err) = cache.invalidate_matter(matter_id).await {
        tracing::warn!(matter_id, error = %err, "cache invalidation failed during finalize, continuing");
    }

    connections
        .broadcast_to_matter(matter_id, &ServerMessage::DocumentReady { document_id: document_id.to_string() })
        .await;

    Ok(())
}
