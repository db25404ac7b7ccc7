//! A named-entity occurrence in a [`crate::models::TextChunk`], resolved to a
//! canonical entity via name normalization and fuzzy matching.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Organization,
    Statute,
    DateToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    pub id: i64,
    pub chunk_id: i64,
    pub canonical_entity_id: String,
    pub kind: EntityKind,
    pub surface_form: String,
    pub aliases: Vec<String>,
}

impl EntityMention {
    pub fn new(chunk_id: i64, canonical_entity_id: String, kind: EntityKind, surface_form: String) -> Self {
        Self {
            id: 0,
            chunk_id,
            canonical_entity_id,
            kind,
            surface_form,
            aliases: Vec::new(),
        }
    }
}
