//! OAuth client model - tenant-scoped relying parties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::utils::crypto::{constant_time_eq, generate_token, hash_token};

pub const DEFAULT_AUTHORIZATION_CODE_LIFETIME_SECONDS: i32 = 60;
pub const DEFAULT_ACCESS_ID_TOKEN_LIFETIME_SECONDS: i32 = 3600;
pub const DEFAULT_REFRESH_TOKEN_LIFETIME_SECONDS: i32 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Holds a secret; authenticates at the token endpoint.
    Confidential,
    /// Cannot keep a secret; must use PKCE.
    Public,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Confidential => "confidential",
            ClientType::Public => "public",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confidential" => Ok(ClientType::Confidential),
            "public" => Ok(ClientType::Public),
            other => Err(format!("Invalid client type: {}", other)),
        }
    }
}

impl TryFrom<String> for ClientType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub client_pk: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_hash: String,
    #[sqlx(try_from = "String")]
    pub client_type: ClientType,
    /// First-party clients skip the consent screen.
    pub first_party: bool,
    pub redirect_uris: Vec<String>,
    pub encrypt_jwk: Option<String>,
    pub authorization_code_lifetime_seconds: i32,
    pub access_id_token_lifetime_seconds: i32,
    pub refresh_token_lifetime_seconds: i32,
    pub created_utc: DateTime<Utc>,
}

impl Client {
    /// Create a client with default lifetimes. Returns the plaintext secret,
    /// which is never stored.
    pub fn new(
        tenant_id: Uuid,
        name: String,
        client_type: ClientType,
        redirect_uris: Vec<String>,
        first_party: bool,
    ) -> (Self, String) {
        let secret = generate_token();
        let client = Self {
            client_pk: Uuid::new_v4(),
            tenant_id,
            name,
            client_id: generate_token(),
            client_secret_hash: hash_token(&secret),
            client_type,
            first_party,
            redirect_uris,
            encrypt_jwk: None,
            authorization_code_lifetime_seconds: DEFAULT_AUTHORIZATION_CODE_LIFETIME_SECONDS,
            access_id_token_lifetime_seconds: DEFAULT_ACCESS_ID_TOKEN_LIFETIME_SECONDS,
            refresh_token_lifetime_seconds: DEFAULT_REFRESH_TOKEN_LIFETIME_SECONDS,
            created_utc: Utc::now(),
        };
        (client, secret)
    }

    pub fn is_public(&self) -> bool {
        self.client_type == ClientType::Public
    }

    /// Exact string match against the registered redirect URIs.
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn verify_secret(&self, secret: &str) -> bool {
        constant_time_eq(&hash_token(secret), &self.client_secret_hash)
    }

    pub fn authorization_code_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.authorization_code_lifetime_seconds.into())
    }

    pub fn access_id_token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_id_token_lifetime_seconds.into())
    }

    pub fn refresh_token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_token_lifetime_seconds.into())
    }
}
