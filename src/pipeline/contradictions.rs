//! `detect_contradictions(document_id)` (expansion, §4.4.1) — compare pairs
//! of already-extracted events sharing an entity or overlapping date range,
//! and emit a `ConsistencyIssue` for any pair the LLM flags as inconsistent.
//!
//! Grounded in `original_source/backend/app/services/contradiction/
//! comparator.py`; runs after `extract_events`/`extract_entities` in the
//! same parallel `extract` fan-out, same as the other extractors a
//! stateless transform over already-persisted rows.

use crate::error::{PipelineError, Result};
use crate::models::{ConsistencyIssue, IssueSeverity, TimelineEvent};

use super::{LlmProvider, PipelineStore};

#[derive(Debug, serde::Deserialize)]
struct RawVerdict {
    contradictory: bool,
    description: String,
    severity: String,
}

fn severity_from_str(s: &str) -> IssueSeverity {
    match s {
        "high" => IssueSeverity::High,
        "medium" => IssueSeverity::Medium,
        _ => IssueSeverity::Low,
    }
}

/// Two events are candidate pairs if they share at least one named entity
/// or their event_date strings are identical (exact date overlap; §4.4.1
/// doesn't specify fuzzy date-range overlap, so this stays literal).
pub fn candidate_pairs(events: &[TimelineEvent]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..events.len() {
        for j in (i + 1)..events.len() {
            let shares_entity = events[i].entities_involved.iter().any(|e| events[j].entities_involved.contains(e));
            let same_date = events[i].event_date == events[j].event_date;
            if shares_entity || same_date {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

pub async fn run(
    store: &dyn PipelineStore,
    provider: &dyn LlmProvider,
    provider_name: &str,
    document_id: &str,
) -> Result<Vec<ConsistencyIssue>> {
    let events = store.get_events(document_id).await?;
    let pairs = candidate_pairs(&events);
    let mut issues = Vec::new();

    for (i, j) in pairs {
        let prompt_context = format!(
            "Event A: {}\nEvent B: {}",
            events[i].description, events[j].description
        );
        let raw = provider.extract_structured(provider_name, "detect_contradictions", &prompt_context).await?;
        let verdict: RawVerdict = serde_json::from_str(&raw).map_err(|e| PipelineError::Integrity(e.to_string()))?;

        if verdict.contradictory {
            issues.push(ConsistencyIssue::new(
                document_id.to_string(),
                events[i].id,
                events[j].id,
                verdict.description,
                severity_from_str(&verdict.severity),
            ));
        }
    }

    store.save_consistency_issues(document_id, &issues).await?;
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatePrecision;

    fn event(date: &str, entities: &[&str]) -> TimelineEvent {
        let mut e = TimelineEvent::new(
            "doc".into(),
            date.into(),
            DatePrecision::Day,
            date.into(),
            "desc".into(),
            "filing".into(),
            1,
        );
        e.entities_involved = entities.iter().map(|s| s.to_string()).collect();
        e
    }

    #[test]
    fn pairs_sharing_an_entity_are_candidates() {
        let events = vec![event("2024-01-01", &["alice"]), event("2024-02-01", &["alice"])];
        assert_eq!(candidate_pairs(&events), vec![(0, 1)]);
    }

    #[test]
    fn pairs_with_same_date_are_candidates() {
        let events = vec![event("2024-01-01", &["alice"]), event("2024-01-01", &["bob"])];
        assert_eq!(candidate_pairs(&events), vec![(0, 1)]);
    }

    #[test]
    fn unrelated_events_are_not_candidates() {
        let events = vec![event("2024-01-01", &["alice"]), event("2024-02-01", &["bob"])];
        assert!(candidate_pairs(&events).is_empty());
    }
}
