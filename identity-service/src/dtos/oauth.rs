use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::oauth::SUPPORTED_SCOPES;

/// `POST /token` form body. Every field is optional at the wire level; the
/// grant handlers report what is missing in the OAuth envelope.
#[derive(Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    #[schema(example = "authorization_code")]
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequest")
            .field("grant_type", &self.grant_type)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: Uuid,
    #[schema(example = "user@example.com")]
    pub email: String,
    pub email_verified: bool,
    pub tenant_id: Uuid,
    #[schema(value_type = Object)]
    pub fields: serde_json::Value,
}

/// OpenID Provider metadata for one tenant.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DiscoveryDocument {
    #[schema(example = "https://acme.example.com")]
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub id_token_encryption_alg_values_supported: Vec<String>,
    pub id_token_encryption_enc_values_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub acr_values_supported: Vec<String>,
    pub prompt_values_supported: Vec<String>,
    pub claims_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl DiscoveryDocument {
    pub fn for_issuer(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{}/authorize", issuer),
            token_endpoint: format!("{}/token", issuer),
            userinfo_endpoint: format!("{}/userinfo", issuer),
            jwks_uri: format!("{}/.well-known/jwks.json", issuer),
            scopes_supported: strings(SUPPORTED_SCOPES),
            response_types_supported: strings(&["code"]),
            response_modes_supported: strings(&["query", "fragment"]),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&["RS256"]),
            id_token_encryption_alg_values_supported: strings(&["RSA-OAEP-256"]),
            id_token_encryption_enc_values_supported: strings(&["A256GCM"]),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
            code_challenge_methods_supported: strings(&["plain", "S256"]),
            acr_values_supported: strings(&["0", "1"]),
            prompt_values_supported: strings(&["none", "login", "consent"]),
            claims_supported: strings(&[
                "sub",
                "iss",
                "aud",
                "azp",
                "exp",
                "iat",
                "auth_time",
                "acr",
                "nonce",
                "email",
                "email_verified",
                "tenant_id",
                "fields",
                "c_hash",
                "at_hash",
            ]),
        }
    }
}
