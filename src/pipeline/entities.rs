//! `extract_entities` / `extract_citations` / `extract_events` — read child
//! Chunks, invoke the corresponding LLM extraction, link results to bboxes,
//! and persist. The extraction prompts themselves are out of scope (§1
//! treats these as stateless transform functions); this module owns the
//! surrounding orchestration: which chunks feed the call, how a raw result
//! maps onto a typed row, and the bbox backlink.

use crate::error::{PipelineError, Result};
use crate::models::{
    Citation, CitationResolutionStatus, DatePrecision, EntityKind, EntityMention, TimelineEvent,
};

use super::extract_shared::bboxes_for_span;
use super::{LlmProvider, PipelineStore};

/// One structured extraction the provider returns per chunk, before it's
/// turned into a typed row and linked to bboxes. The provider's actual
/// response schema is an LP concern; this is the shape this pipeline
/// expects back from `extract_structured`.
#[derive(Debug, serde::Deserialize)]
pub struct RawEntity {
    pub surface_form: String,
    pub kind: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct RawCitation {
    pub act_name: String,
    pub section: String,
    pub subsection: Option<String>,
    pub raw_text: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct RawEvent {
    pub event_date: String,
    pub precision: String,
    pub event_date_text: String,
    pub description: String,
    pub event_type: String,
    pub entities_involved: Vec<String>,
}

fn entity_kind_from_str(s: &str) -> EntityKind {
    match s {
        "organization" => EntityKind::Organization,
        "statute" => EntityKind::Statute,
        "date_token" => EntityKind::DateToken,
        _ => EntityKind::Person,
    }
}

fn precision_from_str(s: &str) -> DatePrecision {
    match s {
        "month" => DatePrecision::Month,
        "year" => DatePrecision::Year,
        _ => DatePrecision::Day,
    }
}

pub async fn extract_entities(
    store: &dyn PipelineStore,
    provider: &dyn LlmProvider,
    provider_name: &str,
    document_id: &str,
) -> Result<Vec<EntityMention>> {
    let chunks = store.get_text_chunks(document_id).await?;
    let boxes = store.get_bounding_boxes(document_id).await?;
    let mut mentions = Vec::new();

    for chunk in chunks.iter().filter(|c| c.chunk_type == crate::models::ChunkType::Child) {
        let raw = provider.extract_structured(provider_name, "extract_entities", &chunk.content).await?;
        let parsed: Vec<RawEntity> = serde_json::from_str(&raw).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        for entity in parsed {
            let chunk_boxes: Vec<_> = chunk.bbox_ids.iter().filter_map(|id| boxes.iter().find(|b| b.id == *id)).cloned().collect();
            let _linked = bboxes_for_span(&entity.surface_form, &chunk_boxes);

            let canonical_entity_id = entity.surface_form.trim().to_lowercase();
            let mut mention =
                EntityMention::new(chunk.id, canonical_entity_id, entity_kind_from_str(&entity.kind), entity.surface_form);
            mention.aliases = entity.aliases;
            mentions.push(mention);
        }
    }

    store.save_entity_mentions(document_id, &mentions).await?;
    Ok(mentions)
}

pub async fn extract_citations(
    store: &dyn PipelineStore,
    provider: &dyn LlmProvider,
    provider_name: &str,
    document_id: &str,
) -> Result<Vec<Citation>> {
    let chunks = store.get_text_chunks(document_id).await?;
    let mut citations = Vec::new();

    for chunk in chunks.iter().filter(|c| c.chunk_type == crate::models::ChunkType::Child) {
        let raw = provider.extract_structured(provider_name, "extract_citations", &chunk.content).await?;
        let parsed: Vec<RawCitation> = serde_json::from_str(&raw).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        for raw_citation in parsed {
            let page = chunk.page_number.unwrap_or(0);
            let mut citation = Citation::new(
                document_id.to_string(),
                raw_citation.act_name,
                raw_citation.section,
                raw_citation.raw_text,
                page,
            );
            citation.subsection = raw_citation.subsection;
            citation.source_bbox_ids = chunk.bbox_ids.clone();
            citation.resolution_status = CitationResolutionStatus::Missing;
            citations.push(citation);
        }
    }

    store.save_citations(document_id, &citations).await?;
    Ok(citations)
}

pub async fn extract_events(
    store: &dyn PipelineStore,
    provider: &dyn LlmProvider,
    provider_name: &str,
    document_id: &str,
) -> Result<Vec<TimelineEvent>> {
    let chunks = store.get_text_chunks(document_id).await?;
    let mut events = Vec::new();

    for chunk in chunks.iter().filter(|c| c.chunk_type == crate::models::ChunkType::Child) {
        let raw = provider.extract_structured(provider_name, "extract_events", &chunk.content).await?;
        let parsed: Vec<RawEvent> = serde_json::from_str(&raw).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        for raw_event in parsed {
            let page = chunk.page_number.unwrap_or(0);
            let mut event = TimelineEvent::new(
                document_id.to_string(),
                raw_event.event_date,
                precision_from_str(&raw_event.precision),
                raw_event.event_date_text,
                raw_event.description,
                raw_event.event_type,
                page,
            );
            event.source_bbox_ids = chunk.bbox_ids.clone();
            event.entities_involved = raw_event.entities_involved;
            events.push(event);
        }
    }

    store.save_events(document_id, &events).await?;
    Ok(events)
}
