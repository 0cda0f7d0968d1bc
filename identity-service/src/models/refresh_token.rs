use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::oauth::Acr;

/// Refresh token row. The plaintext is handed to the client once; lookups
/// go through `token_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub token_hash: String,
    /// Shared by every token descending from the same code exchange.
    pub family_id: Uuid,
    pub tenant_id: Uuid,
    pub client_pk: Uuid,
    pub user_id: Uuid,
    pub scope: Vec<String>,
    #[sqlx(try_from = "i16")]
    pub acr: Acr,
    pub authenticated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Successor produced by rotation: same family, user and scope.
    pub fn successor(
        &self,
        token_hash: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_hash,
            family_id: self.family_id,
            tenant_id: self.tenant_id,
            client_pk: self.client_pk,
            user_id: self.user_id,
            scope: self.scope.clone(),
            acr: self.acr,
            authenticated_at: self.authenticated_at,
            expires_at,
            created_utc: now,
        }
    }
}

/// Tombstone of a rotated-away refresh token, kept until the original
/// expiry so replays can be recognised.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RotatedRefreshToken {
    pub token_hash: String,
    pub tenant_id: Uuid,
    pub family_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Result of the atomic rotate primitive.
#[derive(Debug, Clone)]
pub enum RefreshRotation {
    /// The presented token was consumed; the successor is now live.
    Rotated(RefreshToken),
    /// The presented token had already been rotated away. Every live token of
    /// the family has been revoked.
    Reused { family_id: Uuid, revoked: u64 },
    /// Unknown, expired or bound to another client.
    Absent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_successor_keeps_family_and_scope() {
        let now = Utc::now();
        let token = RefreshToken {
            token_hash: "a".into(),
            family_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            client_pk: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            scope: vec!["openid".into(), "offline_access".into()],
            acr: Acr::Level1,
            authenticated_at: now - Duration::hours(1),
            expires_at: now + Duration::days(1),
            created_utc: now - Duration::hours(1),
        };

        let next = token.successor("b".into(), now + Duration::days(30), now);
        assert_eq!(next.family_id, token.family_id);
        assert_eq!(next.scope, token.scope);
        assert_eq!(next.authenticated_at, token.authenticated_at);
        assert_ne!(next.token_hash, token.token_hash);
    }
}
