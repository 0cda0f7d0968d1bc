use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{ClientType, Tenant};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateTenantRequest {
    #[validate(length(min = 1, max = 63, message = "Slug must be 1-63 characters"))]
    #[schema(example = "beta")]
    pub slug: String,

    #[validate(length(min = 1, message = "Tenant name is required"))]
    #[schema(example = "Beta Customers")]
    pub name: String,

    #[serde(default)]
    pub is_default: bool,

    /// Serialized RSA public JWK for ID token encryption.
    pub encrypt_jwk: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantResponse {
    pub tenant_id: Uuid,
    #[schema(example = "beta")]
    pub slug: String,
    pub name: String,
    pub is_default: bool,
    #[schema(example = "https://acme.example.com/beta")]
    pub issuer: String,
}

impl TenantResponse {
    pub fn new(tenant: &Tenant, issuer: String) -> Self {
        Self {
            tenant_id: tenant.tenant_id,
            slug: tenant.slug.clone(),
            name: tenant.name.clone(),
            is_default: tenant.is_default,
            issuer,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RotateKeyResponse {
    #[schema(example = "3f1c0e5d8b7a4c2e9f6d1a0b2c3d4e5f")]
    pub kid: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateClientRequest {
    #[validate(length(min = 1, message = "Client name is required"))]
    #[schema(example = "My Web App")]
    pub name: String,

    pub client_type: ClientType,

    #[validate(length(min = 1, message = "At least one redirect URI is required"))]
    #[schema(example = "[\"https://app.example.com/callback\"]")]
    pub redirect_uris: Vec<String>,

    #[serde(default)]
    pub first_party: bool,

    pub encrypt_jwk: Option<String>,

    #[validate(range(min = 1, max = 600))]
    pub authorization_code_lifetime_seconds: Option<i32>,

    #[validate(range(min = 60, max = 86400))]
    pub access_id_token_lifetime_seconds: Option<i32>,

    #[validate(range(min = 60))]
    pub refresh_token_lifetime_seconds: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateClientResponse {
    pub client_pk: Uuid,
    #[schema(example = "Jx3pD0cQ9m1u0lQh8bq2vH7y0kq6yE0dJtYxgkq3G9A")]
    pub client_id: String,
    /// Shown once; only its hash is stored.
    pub client_secret: String,
    pub name: String,
    pub client_type: ClientType,
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateUserRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "ada@example.com")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "SecureP@ss123")]
    pub password: String,

    #[serde(default)]
    pub email_verified: bool,

    /// Custom user fields (JSON object).
    #[schema(value_type = Object)]
    pub fields: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreatePermissionRequest {
    #[validate(length(min = 1, message = "Permission name is required"))]
    #[schema(example = "Read castles")]
    pub name: String,

    #[validate(length(min = 1, max = 128, message = "Codename must be 1-128 characters"))]
    #[schema(example = "castles:read")]
    pub codename: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, message = "Role name is required"))]
    #[schema(example = "castle-builder")]
    pub name: String,

    #[serde(default)]
    pub permission_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub add_permission_ids: Vec<Uuid>,
    #[serde(default)]
    pub remove_permission_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddUserPermissionRequest {
    pub permission_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MembershipResponse {
    /// Whether this call changed anything.
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserPermissionsResponse {
    pub user_id: Uuid,
    #[schema(example = "[\"castles:read\"]")]
    pub permissions: Vec<String>,
}
