//! User model - tenant-scoped user accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// User entity (tenant-scoped).
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub email_verified: bool,
    pub hashed_password: String,
    /// Custom user fields, exposed as claims under the `profile` scope.
    pub fields: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn new(tenant_id: Uuid, email: String, hashed_password: String) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            tenant_id,
            email: email.to_lowercase(),
            email_verified: false,
            hashed_password,
            fields: serde_json::Value::Object(Default::default()),
            created_utc: Utc::now(),
        }
    }

    pub fn sanitized(&self) -> SanitizedUser {
        SanitizedUser {
            user_id: self.user_id,
            tenant_id: self.tenant_id,
            email: self.email.clone(),
            email_verified: self.email_verified,
            fields: self.fields.clone(),
            created_utc: self.created_utc,
        }
    }
}

/// User without credentials, safe to return from APIs.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SanitizedUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub email_verified: bool,
    #[schema(value_type = Object)]
    pub fields: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}
