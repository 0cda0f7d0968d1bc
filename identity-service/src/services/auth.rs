use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use crate::config::OidcConfig;
use crate::models::oauth::{is_subset, scope_contains, SCOPE_OPENID};
use crate::models::{
    Acr, AuthorizationCode, Client, Grant, LoginSession, LoginSessionState, Prompt, SessionToken,
    User,
};
use crate::services::authorize::{
    self, redirect_location, AuthorizationRequest, AuthorizeError, RedirectError,
};
use crate::services::error::{OAuthError, OAuthErrorCode, ServiceError};
use crate::services::tenant::TenantContext;
use crate::utils::crypto::{generate_token, half_hash, hash_token};
use crate::utils::{verify_password, Password};

/// A freshly minted authorization code and where to send the user agent.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub location: String,
}

/// What the user agent has to do next in an interactive authorization.
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// Done: redirect back to the client with a code.
    Code(IssuedCode),
    /// Show the login form for this session.
    Login(LoginSession),
    /// Show the consent screen for this session.
    Consent(LoginSession),
}

/// Drives a login session from request to code issuance.
#[derive(Clone)]
pub struct AuthenticationFlow {
    login_session_ttl: Duration,
    session_token_ttl: Duration,
}

impl AuthenticationFlow {
    pub fn new(config: &OidcConfig) -> Self {
        Self {
            login_session_ttl: config.login_session_ttl(),
            session_token_ttl: config.session_token_ttl(),
        }
    }

    pub async fn begin_authorization(
        &self,
        ctx: &TenantContext,
        params: &AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> Result<(LoginSession, Client), AuthorizeError> {
        authorize::begin_authorization(ctx, params, self.login_session_ttl, now).await
    }

    /// Load a live login session together with its client.
    pub async fn get_login_session(
        &self,
        ctx: &TenantContext,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(LoginSession, Client), ServiceError> {
        let session = ctx
            .store
            .get_login_session(ctx.tenant.tenant_id, token, now)
            .await?
            .filter(|s| s.state_at(now) != LoginSessionState::Expired)
            .ok_or(ServiceError::LoginSessionExpired)?;
        let client = ctx
            .store
            .get_client(ctx.tenant.tenant_id, session.client_pk)
            .await?
            .ok_or(ServiceError::LoginSessionExpired)?;
        Ok((session, client))
    }

    /// Password check for the user behind a login session. On success the
    /// session is marked authenticated at ACR 1.
    #[instrument(skip(self, ctx, session, password), fields(tenant_id = %ctx.tenant.tenant_id))]
    pub async fn authenticate_password(
        &self,
        ctx: &TenantContext,
        session: &mut LoginSession,
        email: &str,
        password: &Password,
    ) -> Result<User, ServiceError> {
        let user = ctx
            .store
            .get_user_by_email(ctx.tenant.tenant_id, &email.to_lowercase())
            .await?
            .ok_or(ServiceError::InvalidCredentials)?;

        if !verify_password(password, &user.hashed_password)? {
            warn!(user_id = %user.user_id, "Password verification failed");
            return Err(ServiceError::InvalidCredentials);
        }

        session.mark_authenticated(user.user_id, Acr::Level1);
        ctx.store.update_login_session(session).await?;

        info!(user_id = %user.user_id, "User authenticated");
        Ok(user)
    }

    /// Start an SSO session. Only the hash is stored.
    pub async fn create_session_token(
        &self,
        ctx: &TenantContext,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<(String, SessionToken), ServiceError> {
        let plaintext = generate_token();
        let token = SessionToken {
            token_hash: hash_token(&plaintext),
            tenant_id: ctx.tenant.tenant_id,
            user_id: user.user_id,
            expires_at: now + self.session_token_ttl,
            created_utc: now,
        };
        ctx.store.create_session_token(token.clone()).await?;
        Ok((plaintext, token))
    }

    pub async fn resolve_session_token(
        &self,
        ctx: &TenantContext,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, ServiceError> {
        let Some(session) = ctx
            .store
            .get_session_token(ctx.tenant.tenant_id, &hash_token(token), now)
            .await?
        else {
            return Ok(None);
        };
        Ok(ctx.store.get_user(ctx.tenant.tenant_id, session.user_id).await?)
    }

    pub fn requires_fresh_login(&self, session: &LoginSession) -> bool {
        session.requires_fresh_login()
    }

    pub async fn needs_consent(
        &self,
        ctx: &TenantContext,
        session: &LoginSession,
        client: &Client,
        user: &User,
    ) -> Result<bool, ServiceError> {
        if session.prompt == Some(Prompt::Consent) {
            return Ok(true);
        }
        if client.first_party {
            return Ok(false);
        }
        let grant = ctx.store.get_grant(user.user_id, client.client_pk).await?;
        Ok(!grant.is_some_and(|g| g.covers(&session.scope)))
    }

    /// Issue the code for an authenticated session and consume the session.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant.tenant_id, user_id = %user.user_id))]
    pub async fn get_authorization_code(
        &self,
        ctx: &TenantContext,
        session: &LoginSession,
        client: &Client,
        user: &User,
        acr: Acr,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, ServiceError> {
        self.issue_code(ctx, session, client, user, acr, session.scope.clone(), now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_code(
        &self,
        ctx: &TenantContext,
        session: &LoginSession,
        client: &Client,
        user: &User,
        acr: Acr,
        scope: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, ServiceError> {
        let acr = session.authenticated_acr.map_or(acr, |achieved| achieved.max(acr));
        ctx.store
            .take_login_session(ctx.tenant.tenant_id, &session.token, now)
            .await?
            .ok_or(ServiceError::LoginSessionExpired)?;

        let code = generate_token();
        ctx.store
            .create_authorization_code(AuthorizationCode {
                code_hash: hash_token(&code),
                c_hash: half_hash(&code),
                tenant_id: ctx.tenant.tenant_id,
                client_pk: client.client_pk,
                user_id: user.user_id,
                redirect_uri: session.redirect_uri.clone(),
                scope,
                authenticated_at: now,
                nonce: session.nonce.clone(),
                acr,
                code_challenge: session.code_challenge.clone(),
                code_challenge_method: session.code_challenge_method,
                expires_at: now + client.authorization_code_lifetime(),
            })
            .await?;

        let mut params = vec![("code", code.as_str())];
        if let Some(state) = session.state.as_deref() {
            params.push(("state", state));
        }
        let location = redirect_location(&session.redirect_uri, session.response_mode, &params)?;

        info!(acr = %acr, "Authorization code issued");
        Ok(IssuedCode { code, location })
    }

    /// Record the user's consent decision and, when approved, issue the code.
    #[allow(clippy::too_many_arguments)]
    pub async fn consent(
        &self,
        ctx: &TenantContext,
        session: &LoginSession,
        client: &Client,
        user: &User,
        granted: bool,
        scope: &[String],
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, AuthorizeError> {
        if !granted {
            ctx.store
                .delete_login_session(ctx.tenant.tenant_id, &session.token)
                .await?;
            info!(user_id = %user.user_id, client_id = %client.client_id, "Consent denied");
            return Err(AuthorizeError::Redirect(RedirectError::for_session(
                session,
                OAuthError::new(OAuthErrorCode::AccessDenied, "the user denied the request"),
            )));
        }

        if !scope_contains(scope, SCOPE_OPENID) || !is_subset(scope, &session.scope) {
            return Err(AuthorizeError::Redirect(RedirectError::for_session(
                session,
                OAuthError::invalid_scope("approved scope must be within the requested scope"),
            )));
        }

        let grant = match ctx.store.get_grant(user.user_id, client.client_pk).await? {
            Some(existing) => Grant {
                scope: existing.merged_scope(scope),
                updated_utc: now,
                ..existing
            },
            None => Grant::new(user.user_id, client.client_pk, scope.to_vec()),
        };
        ctx.store.upsert_grant(grant).await?;

        let acr = session.authenticated_acr.unwrap_or(Acr::Level0);
        Ok(self
            .issue_code(ctx, session, client, user, acr, scope.to_vec(), now)
            .await?)
    }

    /// Continue after the user is known: consent check, then code.
    pub async fn after_authentication(
        &self,
        ctx: &TenantContext,
        session: LoginSession,
        client: &Client,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeOutcome, AuthorizeError> {
        if self.needs_consent(ctx, &session, client, user).await? {
            if session.prompt == Some(Prompt::None) {
                return Err(self
                    .abandon(ctx, &session, OAuthErrorCode::ConsentRequired, "consent is required")
                    .await?);
            }
            return Ok(AuthorizeOutcome::Consent(session));
        }

        let acr = session.authenticated_acr.unwrap_or(Acr::Level0);
        let issued = self
            .get_authorization_code(ctx, &session, client, user, acr, now)
            .await?;
        Ok(AuthorizeOutcome::Code(issued))
    }

    /// Decide the next step of a new authorization, given the user (if any)
    /// recognised from an SSO session.
    pub async fn continue_authorization(
        &self,
        ctx: &TenantContext,
        mut session: LoginSession,
        client: &Client,
        sso_user: Option<User>,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeOutcome, AuthorizeError> {
        let sso_user = sso_user.filter(|_| !self.requires_fresh_login(&session));
        let Some(user) = sso_user else {
            if session.prompt == Some(Prompt::None) {
                return Err(self
                    .abandon(ctx, &session, OAuthErrorCode::LoginRequired, "login is required")
                    .await?);
            }
            return Ok(AuthorizeOutcome::Login(session));
        };

        session.mark_authenticated(user.user_id, Acr::Level0);
        ctx.store.update_login_session(&session).await?;
        self.after_authentication(ctx, session, client, &user, now).await
    }

    async fn abandon(
        &self,
        ctx: &TenantContext,
        session: &LoginSession,
        code: OAuthErrorCode,
        description: &str,
    ) -> Result<AuthorizeError, ServiceError> {
        ctx.store
            .delete_login_session(ctx.tenant.tenant_id, &session.token)
            .await?;
        Ok(AuthorizeError::Redirect(RedirectError::for_session(
            session,
            OAuthError::new(code, description),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientType, Tenant, Workspace};
    use crate::services::keys::testing::tenant_key;
    use crate::store::memory::MemoryWorkspaceStore;
    use crate::store::WorkspaceStore;
    use crate::utils::hash_password;
    use std::sync::Arc;

    struct Fixture {
        flow: AuthenticationFlow,
        ctx: TenantContext,
        client: Client,
        user: User,
    }

    async fn fixture(first_party: bool) -> Fixture {
        let store = Arc::new(MemoryWorkspaceStore::new());
        let tenant = Tenant::new("main".into(), "Main".into(), true);
        store
            .create_tenant(tenant.clone(), tenant_key(tenant.tenant_id, "k1"))
            .await
            .unwrap();
        let (client, _) = Client::new(
            tenant.tenant_id,
            "App".into(),
            ClientType::Confidential,
            vec!["https://app/cb".into()],
            first_party,
        );
        store.create_client(client.clone()).await.unwrap();
        let hashed = hash_password(&Password::new("s3cret-pass".into())).unwrap();
        let user = User::new(tenant.tenant_id, "Ada@Example.com".into(), hashed);
        store.create_user(user.clone()).await.unwrap();

        Fixture {
            flow: AuthenticationFlow::new(&OidcConfig::default()),
            ctx: TenantContext {
                workspace: Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into()),
                issuer: "https://acme.test".into(),
                tenant,
                store,
            },
            client,
            user,
        }
    }

    async fn begin(f: &Fixture, prompt: Option<&str>) -> LoginSession {
        let params = AuthorizationRequest {
            client_id: Some(f.client.client_id.clone()),
            redirect_uri: Some("https://app/cb".into()),
            response_type: Some("code".into()),
            scope: Some("openid offline_access".into()),
            state: Some("st".into()),
            prompt: prompt.map(str::to_string),
            ..Default::default()
        };
        f.flow
            .begin_authorization(&f.ctx, &params, Utc::now())
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_password_login_marks_session_acr1() {
        let f = fixture(true).await;
        let mut session = begin(&f, None).await;

        let bad = f
            .flow
            .authenticate_password(
                &f.ctx,
                &mut session,
                "ada@example.com",
                &Password::new("nope".into()),
            )
            .await;
        assert!(matches!(bad, Err(ServiceError::InvalidCredentials)));

        let user = f
            .flow
            .authenticate_password(
                &f.ctx,
                &mut session,
                "ADA@example.com",
                &Password::new("s3cret-pass".into()),
            )
            .await
            .unwrap();
        assert_eq!(user.user_id, f.user.user_id);

        let (stored, _) = f
            .flow
            .get_login_session(&f.ctx, &session.token, Utc::now())
            .await
            .unwrap();
        assert_eq!(stored.state_at(Utc::now()), LoginSessionState::Authenticated);
        assert_eq!(stored.authenticated_acr, Some(Acr::Level1));
    }

    #[tokio::test]
    async fn test_code_issuance_consumes_login_session() {
        let f = fixture(true).await;
        let session = begin(&f, None).await;

        let issued = f
            .flow
            .get_authorization_code(&f.ctx, &session, &f.client, &f.user, Acr::Level1, Utc::now())
            .await
            .unwrap();
        assert!(issued.location.starts_with("https://app/cb?code="));
        assert!(issued.location.ends_with("&state=st"));

        assert!(matches!(
            f.flow.get_login_session(&f.ctx, &session.token, Utc::now()).await,
            Err(ServiceError::LoginSessionExpired)
        ));

        let code = f
            .ctx
            .store
            .take_authorization_code(f.ctx.tenant.tenant_id, &hash_token(&issued.code), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.acr, Acr::Level1);
        assert_eq!(code.scope, session.scope);
    }

    #[tokio::test]
    async fn test_login_session_yields_one_code() {
        let f = fixture(true).await;
        let session = begin(&f, None).await;

        let first = f
            .flow
            .get_authorization_code(&f.ctx, &session, &f.client, &f.user, Acr::Level1, Utc::now())
            .await;
        assert!(first.is_ok());

        let second = f
            .flow
            .get_authorization_code(&f.ctx, &session, &f.client, &f.user, Acr::Level1, Utc::now())
            .await;
        assert!(matches!(second, Err(ServiceError::LoginSessionExpired)));
    }

    #[tokio::test]
    async fn test_expired_login_session_is_absent() {
        let f = fixture(true).await;
        let session = begin(&f, None).await;
        let later = Utc::now() + OidcConfig::default().login_session_ttl() + Duration::seconds(1);

        assert!(matches!(
            f.flow.get_login_session(&f.ctx, &session.token, later).await,
            Err(ServiceError::LoginSessionExpired)
        ));
        let issued = f
            .flow
            .get_authorization_code(&f.ctx, &session, &f.client, &f.user, Acr::Level1, later)
            .await;
        assert!(matches!(issued, Err(ServiceError::LoginSessionExpired)));
    }

    #[tokio::test]
    async fn test_expired_sso_session_is_absent() {
        let f = fixture(true).await;
        let now = Utc::now();
        let (token, _) = f.flow.create_session_token(&f.ctx, &f.user, now).await.unwrap();
        let later = now + OidcConfig::default().session_token_ttl() + Duration::seconds(1);

        let user = f.flow.resolve_session_token(&f.ctx, &token, later).await.unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_sso_session_skips_login_with_acr0() {
        let f = fixture(true).await;
        let (token, _) = f.flow.create_session_token(&f.ctx, &f.user, Utc::now()).await.unwrap();
        let sso_user = f.flow.resolve_session_token(&f.ctx, &token, Utc::now()).await.unwrap();
        assert!(sso_user.is_some());

        let session = begin(&f, None).await;
        let outcome = f
            .flow
            .continue_authorization(&f.ctx, session, &f.client, sso_user, Utc::now())
            .await
            .unwrap();
        let AuthorizeOutcome::Code(issued) = outcome else {
            panic!("expected a code");
        };
        let code = f
            .ctx
            .store
            .take_authorization_code(f.ctx.tenant.tenant_id, &hash_token(&issued.code), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.acr, Acr::Level0);
    }

    #[tokio::test]
    async fn test_prompt_login_forces_login_despite_sso() {
        let f = fixture(true).await;
        let session = begin(&f, Some("login")).await;
        let outcome = f
            .flow
            .continue_authorization(&f.ctx, session, &f.client, Some(f.user.clone()), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthorizeOutcome::Login(_)));
    }

    #[tokio::test]
    async fn test_prompt_none_without_session_is_login_required() {
        let f = fixture(true).await;
        let session = begin(&f, Some("none")).await;
        let result = f
            .flow
            .continue_authorization(&f.ctx, session, &f.client, None, Utc::now())
            .await;
        let Err(AuthorizeError::Redirect(err)) = result else {
            panic!("expected redirect");
        };
        assert_eq!(err.error.code, OAuthErrorCode::LoginRequired);
        assert!(err.location().unwrap().contains("error=login_required"));
    }

    #[tokio::test]
    async fn test_third_party_consent_is_remembered() {
        let f = fixture(false).await;
        let session = begin(&f, None).await;
        assert!(f.flow.needs_consent(&f.ctx, &session, &f.client, &f.user).await.unwrap());

        let scope = session.scope.clone();
        f.flow
            .consent(&f.ctx, &session, &f.client, &f.user, true, &scope, Utc::now())
            .await
            .unwrap();

        let again = begin(&f, None).await;
        assert!(!f.flow.needs_consent(&f.ctx, &again, &f.client, &f.user).await.unwrap());

        let forced = begin(&f, Some("consent")).await;
        assert!(f.flow.needs_consent(&f.ctx, &forced, &f.client, &f.user).await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_consent_redirects_access_denied() {
        let f = fixture(false).await;
        let session = begin(&f, None).await;
        let result = f
            .flow
            .consent(&f.ctx, &session, &f.client, &f.user, false, &[], Utc::now())
            .await;
        let Err(AuthorizeError::Redirect(err)) = result else {
            panic!("expected redirect");
        };
        assert_eq!(err.error.code, OAuthErrorCode::AccessDenied);
        assert_eq!(err.state.as_deref(), Some("st"));
    }
}
