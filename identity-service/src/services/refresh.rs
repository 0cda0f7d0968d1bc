use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::models::oauth::{is_subset, parse_scope};
use crate::models::{Client, RefreshRotation};
use crate::services::error::{OAuthError, ServiceError};
use crate::services::jwt::{IssueRequest, TokenResponse, TokenService};
use crate::services::tenant::TenantContext;
use crate::utils::crypto::{generate_token, hash_token};

/// `refresh_token` grant with rotation and reuse detection.
#[derive(Clone)]
pub struct RefreshService {
    tokens: TokenService,
}

impl RefreshService {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant.tenant_id, client_id = %client.client_id))]
    pub async fn refresh(
        &self,
        ctx: &TenantContext,
        refresh_token: &str,
        client: &Client,
        scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, ServiceError> {
        let presented_hash = hash_token(refresh_token);
        let requested_scope = scope.map(parse_scope).filter(|s| !s.is_empty());

        // Scope is checked before rotating so a bad request does not burn the token.
        if let Some(requested) = &requested_scope {
            let current = ctx
                .store
                .get_refresh_token(ctx.tenant.tenant_id, &presented_hash, now)
                .await?;
            if let Some(current) = current.filter(|t| t.client_pk == client.client_pk) {
                if !is_subset(requested, &current.scope) {
                    return Err(OAuthError::invalid_scope(
                        "requested scope exceeds the original grant",
                    )
                    .into());
                }
            }
        }

        let successor_plaintext = generate_token();
        let rotation = ctx
            .store
            .rotate_refresh_token(
                ctx.tenant.tenant_id,
                &presented_hash,
                client.client_pk,
                &hash_token(&successor_plaintext),
                now + client.refresh_token_lifetime(),
                now,
            )
            .await?;

        let successor = match rotation {
            RefreshRotation::Rotated(successor) => successor,
            RefreshRotation::Reused { family_id, revoked } => {
                warn!(
                    family_id = %family_id,
                    revoked,
                    "Refresh token reuse detected; token family revoked"
                );
                return Err(OAuthError::invalid_grant("refresh token is invalid").into());
            }
            RefreshRotation::Absent => {
                return Err(OAuthError::invalid_grant("refresh token is invalid").into());
            }
        };

        let user = ctx
            .store
            .get_user(ctx.tenant.tenant_id, successor.user_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("user no longer exists"))?;

        let scope = requested_scope.unwrap_or_else(|| successor.scope.clone());
        let response = self
            .tokens
            .issue(
                ctx,
                IssueRequest {
                    client,
                    user: &user,
                    scope: &scope,
                    acr: successor.acr,
                    authenticated_at: successor.authenticated_at,
                    nonce: None,
                    code: None,
                    refresh_token: Some(successor_plaintext),
                },
                now,
            )
            .await?;

        info!(user_id = %user.user_id, family_id = %successor.family_id, "Refresh token rotated");
        Ok(response)
    }
}
