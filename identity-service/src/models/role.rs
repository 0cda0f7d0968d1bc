//! RBAC models: roles, permissions and the join rows between them and users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Role {
    pub role_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    pub fn new(name: String) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            name,
            created_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Permission {
    pub permission_id: Uuid,
    pub name: String,
    /// Value placed in the `permissions` claim, e.g. `castles:read`.
    pub codename: String,
    pub created_utc: DateTime<Utc>,
}

impl Permission {
    pub fn new(name: String, codename: String) -> Self {
        Self {
            permission_id: Uuid::new_v4(),
            name,
            codename,
            created_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

/// Permission held by a user. `from_role_id` is `None` for direct
/// assignments and names the source role for derived rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UserPermission {
    pub user_id: Uuid,
    pub permission_id: Uuid,
    pub from_role_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl UserPermission {
    pub fn new(user_id: Uuid, permission_id: Uuid, from_role_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            permission_id,
            from_role_id,
            created_utc: Utc::now(),
        }
    }

    pub fn is_derived(&self) -> bool {
        self.from_role_id.is_some()
    }
}
