//! `extract_tables(document_id)` (expansion, §4.4.2) — a fourth parallel
//! extractor alongside entities/citations/events, producing structured
//! tables (schedules of exhibits, financial statements) that the distilled
//! trio omits.
//!
//! Grounded in `original_source/backend/app/services/table_extraction/
//! {formatter,models}.py`. Additive: does not affect the §8 invariants for
//! the entity/citation/event trio.

use crate::error::{PipelineError, Result};
use crate::models::ExtractedTable;

use super::{LlmProvider, PipelineStore};

#[derive(Debug, serde::Deserialize)]
struct RawTable {
    rows: Vec<Vec<String>>,
    caption: Option<String>,
}

pub async fn run(
    store: &dyn PipelineStore,
    provider: &dyn LlmProvider,
    provider_name: &str,
    document_id: &str,
) -> Result<Vec<ExtractedTable>> {
    let chunks = store.get_text_chunks(document_id).await?;
    let mut tables = Vec::new();

    for chunk in chunks.iter().filter(|c| c.chunk_type == crate::models::ChunkType::Child) {
        let raw = provider.extract_structured(provider_name, "extract_tables", &chunk.content).await?;
        let parsed: Vec<RawTable> = serde_json::from_str(&raw).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        for raw_table in parsed {
            if raw_table.rows.is_empty() {
                continue;
            }
            let page = chunk.page_number.unwrap_or(0);
            let mut table = ExtractedTable::new(document_id.to_string(), page, raw_table.rows);
            table.source_bbox_ids = chunk.bbox_ids.clone();
            table.caption = raw_table.caption;
            tables.push(table);
        }
    }

    store.save_tables(document_id, &tables).await?;
    Ok(tables)
}
