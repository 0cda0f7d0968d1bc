//! Token endpoint client authentication: `client_secret_basic`,
//! `client_secret_post` and `none` (public clients).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::models::Client;
use crate::services::error::{OAuthError, ServiceError};
use crate::services::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub method: ClientAuthMethod,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// `application/x-www-form-urlencoded` decoding of one credential component.
fn form_decode(value: &str) -> Result<String, OAuthError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&format!("v={}", value))
        .map_err(|_| OAuthError::invalid_client("malformed credentials"))?;
    pairs
        .into_iter()
        .next()
        .map(|(_, v)| v)
        .ok_or_else(|| OAuthError::invalid_client("malformed credentials"))
}

fn parse_basic(header: &str) -> Result<(String, String), OAuthError> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or_else(|| OAuthError::invalid_client("unsupported authorization scheme"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| OAuthError::invalid_client("malformed basic credentials"))?;
    let (id, secret) = decoded
        .split_once(':')
        .ok_or_else(|| OAuthError::invalid_client("malformed basic credentials"))?;
    Ok((form_decode(id)?, form_decode(secret)?))
}

impl ClientCredentials {
    /// Collect credentials from the `Authorization` header and form body.
    /// Using more than one method at once is rejected.
    pub fn from_request(
        authorization: Option<&str>,
        form_client_id: Option<&str>,
        form_client_secret: Option<&str>,
    ) -> Result<Self, OAuthError> {
        if let Some(header) = authorization {
            if form_client_secret.is_some() {
                return Err(OAuthError::invalid_request(
                    "multiple client authentication methods",
                ));
            }
            let (client_id, client_secret) = parse_basic(header)?;
            if form_client_id.is_some_and(|id| id != client_id) {
                return Err(OAuthError::invalid_request("client_id mismatch"));
            }
            return Ok(Self {
                client_id,
                client_secret: Some(client_secret),
                method: ClientAuthMethod::ClientSecretBasic,
            });
        }

        let client_id = form_client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OAuthError::invalid_client("client authentication required"))?
            .to_string();
        Ok(match form_client_secret {
            Some(secret) => Self {
                client_id,
                client_secret: Some(secret.to_string()),
                method: ClientAuthMethod::ClientSecretPost,
            },
            None => Self {
                client_id,
                client_secret: None,
                method: ClientAuthMethod::None,
            },
        })
    }
}

/// Resolve and authenticate the calling client within the current tenant.
pub async fn authenticate_client(
    ctx: &TenantContext,
    credentials: &ClientCredentials,
) -> Result<Client, ServiceError> {
    let client = ctx
        .store
        .get_client_by_client_id(ctx.tenant.tenant_id, &credentials.client_id)
        .await?
        .ok_or_else(|| OAuthError::invalid_client("unknown client"))?;

    match (&credentials.client_secret, client.is_public()) {
        (Some(secret), _) if client.verify_secret(secret) => Ok(client),
        (Some(_), _) => {
            debug!(client_id = %client.client_id, "Client secret mismatch");
            Err(OAuthError::invalid_client("client authentication failed").into())
        }
        (None, true) => Ok(client),
        (None, false) => {
            Err(OAuthError::invalid_client("confidential clients must authenticate").into())
        }
    }
}
