//! Tenant model. Every row in the pipeline's data model carries a `matter_id`
//! and every query must filter by it (enforced at the repository layer, not
//! here — this module only defines the shape).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Member role within a matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterRole {
    Owner,
    Editor,
    Viewer,
}

/// A legal case: the tenancy unit for everything else in the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matter {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Matter {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
