//! Tenant model - OIDC sub-realm inside a workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tenant entity. Each tenant has its own issuer and signing keys.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_default: bool,
    /// Serialized RSA public JWK used to encrypt ID tokens for clients
    /// that do not declare their own key.
    pub encrypt_jwk: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Tenant {
    pub fn new(slug: String, name: String, is_default: bool) -> Self {
        Self {
            tenant_id: Uuid::new_v4(),
            slug: slug.to_lowercase(),
            name,
            is_default,
            encrypt_jwk: None,
            created_utc: Utc::now(),
        }
    }

    /// Issuer URL: the bare host for the default tenant, host plus slug otherwise.
    pub fn issuer(&self, scheme: &str, domain: &str) -> String {
        if self.is_default {
            format!("{}://{}", scheme, domain)
        } else {
            format!("{}://{}/{}", scheme, domain, self.slug)
        }
    }
}

/// Signing key of a tenant. Exactly one key per tenant is current; retired
/// keys stay published for verification until pruned.
#[derive(Clone, Serialize, Deserialize, FromRow)]
pub struct TenantKey {
    pub kid: String,
    pub tenant_id: Uuid,
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    pub is_current: bool,
    pub created_utc: DateTime<Utc>,
}

impl std::fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantKey")
            .field("kid", &self.kid)
            .field("tenant_id", &self.tenant_id)
            .field("is_current", &self.is_current)
            .field("created_utc", &self.created_utc)
            .finish_non_exhaustive()
    }
}
