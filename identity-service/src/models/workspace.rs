//! Workspace model - root of multi-tenancy, lives in the main database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Isolated unit with its own storage schema.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub workspace_id: Uuid,
    pub name: String,
    /// Host that routes to this workspace.
    pub domain: String,
    pub schema_name: String,
    pub created_utc: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: String, domain: String, schema_name: String) -> Self {
        Self {
            workspace_id: Uuid::new_v4(),
            name,
            domain: domain.to_lowercase(),
            schema_name,
            created_utc: Utc::now(),
        }
    }

    /// Schema names are interpolated into connection parameters, so only
    /// plain lowercase identifiers are accepted.
    pub fn has_valid_schema_name(&self) -> bool {
        let name = self.schema_name.as_str();
        !name.is_empty()
            && name.len() <= 63
            && name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}
