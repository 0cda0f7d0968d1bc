use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::oauth::is_subset;

/// Persisted consent of a user to a client. Unique per `(user, client)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Grant {
    pub user_id: Uuid,
    pub client_pk: Uuid,
    pub scope: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Grant {
    pub fn new(user_id: Uuid, client_pk: Uuid, scope: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            client_pk,
            scope,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn covers(&self, requested: &[String]) -> bool {
        is_subset(requested, &self.scope)
    }

    /// Union of the granted and newly approved scope, order preserved.
    pub fn merged_scope(&self, approved: &[String]) -> Vec<String> {
        let mut scope = self.scope.clone();
        for value in approved {
            if !scope.contains(value) {
                scope.push(value.clone());
            }
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_coverage_and_merge() {
        let grant = Grant::new(Uuid::new_v4(), Uuid::new_v4(), vec!["openid".into()]);
        assert!(grant.covers(&["openid".to_string()]));
        assert!(!grant.covers(&["openid".to_string(), "email".to_string()]));

        let merged = grant.merged_scope(&["email".to_string(), "openid".to_string()]);
        assert_eq!(merged, vec!["openid".to_string(), "email".to_string()]);
    }
}
