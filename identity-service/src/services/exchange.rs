use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::models::{AuthorizationCode, Client, CodeChallengeMethod};
use crate::services::error::{OAuthError, ServiceError};
use crate::services::jwt::{IssueRequest, TokenResponse, TokenService};
use crate::services::tenant::TenantContext;
use crate::utils::crypto::{constant_time_eq, hash_token, pkce_s256};

/// `authorization_code` grant.
#[derive(Clone)]
pub struct CodeExchanger {
    tokens: TokenService,
}

fn verify_pkce(code: &AuthorizationCode, code_verifier: Option<&str>) -> Result<(), OAuthError> {
    let Some(challenge) = code.code_challenge.as_deref() else {
        return Ok(());
    };
    let verifier =
        code_verifier.ok_or_else(|| OAuthError::invalid_grant("code_verifier is required"))?;
    let computed = match code.code_challenge_method.unwrap_or(CodeChallengeMethod::Plain) {
        CodeChallengeMethod::S256 => pkce_s256(verifier),
        CodeChallengeMethod::Plain => verifier.to_string(),
    };
    if !constant_time_eq(&computed, challenge) {
        return Err(OAuthError::invalid_grant("code_verifier does not match"));
    }
    Ok(())
}

impl CodeExchanger {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    /// Redeem a code. The code is deleted by the lookup itself, so every
    /// failure below leaves it unusable.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant.tenant_id, client_id = %client.client_id))]
    pub async fn exchange(
        &self,
        ctx: &TenantContext,
        code: &str,
        client: &Client,
        redirect_uri: Option<&str>,
        code_verifier: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, ServiceError> {
        let stored = ctx
            .store
            .take_authorization_code(ctx.tenant.tenant_id, &hash_token(code), now)
            .await?
            .ok_or_else(|| {
                debug!("Unknown, expired or consumed authorization code");
                OAuthError::invalid_grant("authorization code is invalid or expired")
            })?;

        if stored.client_pk != client.client_pk {
            return Err(OAuthError::invalid_grant("code was issued to another client").into());
        }
        if redirect_uri != Some(stored.redirect_uri.as_str()) {
            return Err(OAuthError::invalid_grant("redirect_uri does not match").into());
        }
        verify_pkce(&stored, code_verifier)?;

        let user = ctx
            .store
            .get_user(ctx.tenant.tenant_id, stored.user_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("user no longer exists"))?;

        let response = self
            .tokens
            .issue(
                ctx,
                IssueRequest {
                    client,
                    user: &user,
                    scope: &stored.scope,
                    acr: stored.acr,
                    authenticated_at: stored.authenticated_at,
                    nonce: stored.nonce.as_deref(),
                    code: Some(code),
                    refresh_token: None,
                },
                now,
            )
            .await?;

        info!(user_id = %user.user_id, "Authorization code exchanged");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Acr;
    use chrono::Duration;
    use uuid::Uuid;

    fn code(challenge: Option<&str>, method: Option<CodeChallengeMethod>) -> AuthorizationCode {
        let now = Utc::now();
        AuthorizationCode {
            code_hash: hash_token("k"),
            c_hash: String::new(),
            tenant_id: Uuid::new_v4(),
            client_pk: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            redirect_uri: "https://app/cb".into(),
            scope: vec!["openid".into()],
            authenticated_at: now,
            nonce: None,
            acr: Acr::Level1,
            code_challenge: challenge.map(str::to_string),
            code_challenge_method: method,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[test]
    fn test_pkce_s256() {
        let c = code(
            Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"),
            Some(CodeChallengeMethod::S256),
        );
        assert!(verify_pkce(&c, Some("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk")).is_ok());
        assert!(verify_pkce(&c, Some("wrong")).is_err());
        assert!(verify_pkce(&c, None).is_err());
    }

    #[test]
    fn test_pkce_plain_and_absent() {
        let c = code(Some("verifier"), Some(CodeChallengeMethod::Plain));
        assert!(verify_pkce(&c, Some("verifier")).is_ok());
        assert!(verify_pkce(&c, Some("other")).is_err());

        let no_pkce = code(None, None);
        assert!(verify_pkce(&no_pkce, None).is_ok());
    }
}
