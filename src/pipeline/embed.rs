//! `embed(document_id)` — batched, rate-limited embedding of child chunks.

use crate::error::Result;

use super::{LlmProvider, PipelineStore};

/// Default batch size; provider-specific overrides live in
/// `PipelineConfig::embedding_batch_size`.
pub const DEFAULT_BATCH_SIZE: usize = 64;

pub async fn run(store: &dyn PipelineStore, provider: &dyn LlmProvider, provider_name: &str, document_id: &str) -> Result<usize> {
    let mut chunks = store.get_text_chunks(document_id).await?;
    chunks.retain(|c| c.chunk_type == crate::models::ChunkType::Child && c.embedding.is_none());

    let mut embedded_count = 0;
    for batch in chunks.chunks_mut(DEFAULT_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = provider.embed_batch(provider_name, &texts).await?;

        for (chunk, vector) in batch.iter_mut().zip(vectors.into_iter()) {
            chunk.embedding = Some(vector);
            store.update_text_chunk(chunk).await?;
            embedded_count += 1;
        }
    }

    Ok(embedded_count)
}
