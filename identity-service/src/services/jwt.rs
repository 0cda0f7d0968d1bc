use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::oauth::{scope_contains, SCOPE_OFFLINE_ACCESS, SCOPE_PROFILE};
use crate::models::{Acr, Client, RefreshToken, User};
use crate::services::error::{OAuthError, OAuthErrorCode, ServiceError};
use crate::services::jwe;
use crate::services::keys::KeyStore;
use crate::services::tenant::TenantContext;
use crate::utils::crypto::{generate_token, half_hash, hash_token};

/// Mints and validates the tokens of a tenant.
#[derive(Clone)]
pub struct TokenService {
    keys: KeyStore,
}

/// Claims for access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Subject (user ID)
    pub sub: String,
    pub aud: Vec<String>,
    /// Authorized party (client_id)
    pub azp: String,
    /// Space-delimited granted scope
    pub scope: String,
    pub permissions: Vec<String>,
    pub acr: Acr,
    pub iat: i64,
    pub exp: i64,
    pub tenant_id: Uuid,
}

/// Claims for ID tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub azp: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    pub acr: Acr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub email: String,
    pub email_verified: bool,
    pub tenant_id: Uuid,
    /// Custom user fields, present with the `profile` scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    pub at_hash: String,
}

/// Token response returned to client
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Everything a grant has established about the authentication being
/// turned into tokens.
#[derive(Debug, Clone)]
pub struct IssueRequest<'a> {
    pub client: &'a Client,
    pub user: &'a User,
    pub scope: &'a [String],
    pub acr: Acr,
    pub authenticated_at: DateTime<Utc>,
    pub nonce: Option<&'a str>,
    /// Plaintext authorization code, for `c_hash`.
    pub code: Option<&'a str>,
    /// Plaintext of an already persisted refresh token (rotation). When
    /// absent and `offline_access` was granted a new family is started.
    pub refresh_token: Option<String>,
}

impl TokenService {
    pub fn new(keys: KeyStore) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Sign access and ID tokens with the tenant's current key.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant.tenant_id, client_id = %request.client.client_id))]
    pub async fn issue(
        &self,
        ctx: &TenantContext,
        request: IssueRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, ServiceError> {
        let IssueRequest {
            client,
            user,
            scope,
            acr,
            authenticated_at,
            nonce,
            code,
            refresh_token,
        } = request;

        let key = self.keys.signing_key(ctx).await?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid.clone());

        let lifetime = client.access_id_token_lifetime();
        let exp = (now + lifetime).timestamp();
        let permissions = ctx.store.list_user_permission_codenames(user.user_id).await?;

        let access_claims = AccessTokenClaims {
            iss: ctx.issuer.clone(),
            sub: user.user_id.to_string(),
            aud: vec![client.client_id.clone()],
            azp: client.client_id.clone(),
            scope: scope.join(" "),
            permissions,
            acr,
            iat: now.timestamp(),
            exp,
            tenant_id: ctx.tenant.tenant_id,
        };
        let access_token = encode(&header, &access_claims, &key.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;

        let id_claims = IdTokenClaims {
            iss: ctx.issuer.clone(),
            sub: user.user_id.to_string(),
            aud: client.client_id.clone(),
            azp: client.client_id.clone(),
            iat: now.timestamp(),
            exp,
            auth_time: authenticated_at.timestamp(),
            acr,
            nonce: nonce.map(str::to_string),
            email: user.email.clone(),
            email_verified: user.email_verified,
            tenant_id: ctx.tenant.tenant_id,
            fields: scope_contains(scope, SCOPE_PROFILE).then(|| user.fields.clone()),
            c_hash: code.map(half_hash),
            at_hash: half_hash(&access_token),
        };
        let mut id_token = encode(&header, &id_claims, &key.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode ID token: {}", e))?;

        if let Some(jwk) = self.keys.encryption_key(ctx, client)? {
            id_token = jwe::encrypt_compact(&jwk, &id_token)?;
            debug!(kid = ?jwk.kid, "ID token encrypted");
        }

        let refresh_token = match refresh_token {
            Some(token) => Some(token),
            None if scope_contains(scope, SCOPE_OFFLINE_ACCESS) => Some(
                self.start_refresh_family(ctx, client, user, scope, acr, authenticated_at, now)
                    .await?,
            ),
            None => None,
        };

        Ok(TokenResponse {
            access_token,
            id_token,
            token_type: "bearer".to_string(),
            expires_in: lifetime.num_seconds(),
            refresh_token,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_refresh_family(
        &self,
        ctx: &TenantContext,
        client: &Client,
        user: &User,
        scope: &[String],
        acr: Acr,
        authenticated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<String, ServiceError> {
        let plaintext = generate_token();
        let token = RefreshToken {
            token_hash: hash_token(&plaintext),
            family_id: Uuid::new_v4(),
            tenant_id: ctx.tenant.tenant_id,
            client_pk: client.client_pk,
            user_id: user.user_id,
            scope: scope.to_vec(),
            acr,
            authenticated_at,
            expires_at: now + client.refresh_token_lifetime(),
            created_utc: now,
        };
        ctx.store.create_refresh_token(token).await?;
        Ok(plaintext)
    }

    /// Validate a bearer access token against the tenant's published keys.
    pub async fn validate_access_token(
        &self,
        ctx: &TenantContext,
        token: &str,
    ) -> Result<AccessTokenClaims, ServiceError> {
        let invalid = |reason: &str| {
            ServiceError::OAuth(OAuthError::new(OAuthErrorCode::InvalidToken, reason))
        };

        let header = decode_header(token).map_err(|_| invalid("malformed token"))?;
        let kid = header.kid.ok_or_else(|| invalid("token has no key id"))?;
        let key = self
            .keys
            .find_verification_key(ctx, &kid)
            .await?
            .ok_or_else(|| invalid("unknown signing key"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_issuer(&[ctx.issuer.as_str()]);

        let token_data = decode::<AccessTokenClaims>(token, &key.decoding_key, &validation)
            .map_err(|e| {
                debug!(error = %e, "Access token rejected");
                invalid("token is invalid or expired")
            })?;

        if token_data.claims.tenant_id != ctx.tenant.tenant_id {
            return Err(invalid("token was issued for another tenant"));
        }
        Ok(token_data.claims)
    }
}
