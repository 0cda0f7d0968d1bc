//! `/authorize` request validation.
//!
//! Errors about the client or its redirect URI are shown to the user agent
//! directly; every later error is sent back to the (now trusted) redirect URI.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};
use utoipa::IntoParams;

use crate::models::oauth::{parse_scope, scope_contains, SCOPE_OPENID, SUPPORTED_SCOPES};
use crate::models::{Acr, Client, CodeChallengeMethod, LoginSession, Prompt, ResponseMode};
use crate::services::error::{OAuthError, OAuthErrorCode, ServiceError};
use crate::services::tenant::TenantContext;
use crate::utils::crypto::generate_token;

/// Raw `/authorize` query parameters.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizationRequest {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub response_mode: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub prompt: Option<String>,
    pub acr_values: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// A protocol error delivered to the client's redirect URI.
#[derive(Debug, Clone)]
pub struct RedirectError {
    pub redirect_uri: String,
    pub response_mode: ResponseMode,
    pub error: OAuthError,
    pub state: Option<String>,
}

impl RedirectError {
    pub fn for_session(session: &LoginSession, error: OAuthError) -> Self {
        Self {
            redirect_uri: session.redirect_uri.clone(),
            response_mode: session.response_mode,
            error,
            state: session.state.clone(),
        }
    }

    pub fn location(&self) -> Result<String, ServiceError> {
        let mut params = vec![("error", self.error.code.as_str())];
        if let Some(description) = self.error.description.as_deref() {
            params.push(("error_description", description));
        }
        if let Some(state) = self.state.as_deref() {
            params.push(("state", state));
        }
        redirect_location(&self.redirect_uri, self.response_mode, &params)
    }
}

#[derive(Debug)]
pub enum AuthorizeError {
    /// Unsafe to redirect: unknown client or unregistered redirect URI.
    Page(OAuthError),
    Redirect(RedirectError),
    Service(ServiceError),
}

impl From<ServiceError> for AuthorizeError {
    fn from(err: ServiceError) -> Self {
        AuthorizeError::Service(err)
    }
}

impl From<crate::store::StoreError> for AuthorizeError {
    fn from(err: crate::store::StoreError) -> Self {
        AuthorizeError::Service(err.into())
    }
}

/// Append response parameters to a redirect URI in the query or fragment.
pub fn redirect_location(
    redirect_uri: &str,
    response_mode: ResponseMode,
    params: &[(&str, &str)],
) -> Result<String, ServiceError> {
    let encoded = serde_urlencoded::to_string(params)
        .map_err(|e| anyhow::anyhow!("Failed to encode redirect parameters: {}", e))?;
    let separator = match response_mode {
        ResponseMode::Fragment => '#',
        ResponseMode::Query if redirect_uri.contains('?') => '&',
        ResponseMode::Query => '?',
    };
    Ok(format!("{}{}{}", redirect_uri, separator, encoded))
}

/// Fully validated parameters, ready to become a login session.
#[derive(Debug, Clone)]
struct ValidatedRequest {
    response_mode: ResponseMode,
    scope: Vec<String>,
    prompt: Option<Prompt>,
    acr_requested: Option<Acr>,
    code_challenge: Option<String>,
    code_challenge_method: Option<CodeChallengeMethod>,
}

fn parse_prompt(raw: &str) -> Result<Option<Prompt>, OAuthError> {
    let values: Vec<&str> = raw.split(' ').filter(|v| !v.is_empty()).collect();
    match values.as_slice() {
        [] => Ok(None),
        [single] => single
            .parse::<Prompt>()
            .map(Some)
            .map_err(OAuthError::invalid_request),
        many if many.contains(&Prompt::None.as_str()) => Err(OAuthError::invalid_request(
            "prompt=none cannot be combined with other values",
        )),
        _ => Err(OAuthError::invalid_request("only one prompt value is supported")),
    }
}

fn parse_acr_values(raw: &str) -> Result<Option<Acr>, OAuthError> {
    // Several values mean "any of these"; the strongest one is what we aim for.
    raw.split(' ')
        .filter(|v| !v.is_empty())
        .try_fold(None, |best: Option<Acr>, value| {
            let acr = value.parse::<Acr>().map_err(OAuthError::invalid_request)?;
            Ok(Some(best.map_or(acr, |b| b.max(acr))))
        })
}

fn validate_protocol(
    params: &AuthorizationRequest,
    client: &Client,
) -> Result<ValidatedRequest, OAuthError> {
    match params.response_type.as_deref() {
        Some("code") => {}
        Some(other) => {
            return Err(OAuthError::new(
                OAuthErrorCode::UnsupportedResponseType,
                format!("response_type {} is not supported", other),
            ))
        }
        None => return Err(OAuthError::invalid_request("response_type is required")),
    }

    let response_mode = match params.response_mode.as_deref() {
        None => ResponseMode::Query,
        Some(raw) => raw.parse().map_err(OAuthError::invalid_request)?,
    };

    let scope = parse_scope(params.scope.as_deref().unwrap_or_default());
    if scope.is_empty() {
        return Err(OAuthError::invalid_scope("scope is required"));
    }
    if !scope_contains(&scope, SCOPE_OPENID) {
        return Err(OAuthError::invalid_scope("scope must include openid"));
    }
    if let Some(unknown) = scope.iter().find(|s| !SUPPORTED_SCOPES.contains(&s.as_str())) {
        return Err(OAuthError::invalid_scope(format!("unsupported scope {}", unknown)));
    }

    let code_challenge = params.code_challenge.clone().filter(|c| !c.is_empty());
    let code_challenge_method = match (&code_challenge, params.code_challenge_method.as_deref()) {
        (Some(_), Some(raw)) => Some(
            raw.parse::<CodeChallengeMethod>()
                .map_err(OAuthError::invalid_request)?,
        ),
        // RFC 7636: the method defaults to plain.
        (Some(_), None) => Some(CodeChallengeMethod::Plain),
        (None, Some(_)) => {
            return Err(OAuthError::invalid_request(
                "code_challenge_method given without code_challenge",
            ))
        }
        (None, None) => None,
    };
    if client.is_public() && code_challenge.is_none() {
        return Err(OAuthError::invalid_request("public clients must use PKCE"));
    }

    let prompt = match params.prompt.as_deref() {
        Some(raw) => parse_prompt(raw)?,
        None => None,
    };
    let acr_requested = match params.acr_values.as_deref() {
        Some(raw) => parse_acr_values(raw)?,
        None => None,
    };

    Ok(ValidatedRequest {
        response_mode,
        scope,
        prompt,
        acr_requested,
        code_challenge,
        code_challenge_method,
    })
}

/// Validate an authorization request and persist its login session.
#[instrument(skip(ctx, params), fields(tenant_id = %ctx.tenant.tenant_id, client_id = ?params.client_id))]
pub async fn begin_authorization(
    ctx: &TenantContext,
    params: &AuthorizationRequest,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<(LoginSession, Client), AuthorizeError> {
    let client_id = params
        .client_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AuthorizeError::Page(OAuthError::invalid_client("client_id is required")))?;
    let client = ctx
        .store
        .get_client_by_client_id(ctx.tenant.tenant_id, client_id)
        .await?
        .ok_or_else(|| AuthorizeError::Page(OAuthError::invalid_client("unknown client")))?;

    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .filter(|uri| client.has_redirect_uri(uri))
        .ok_or_else(|| {
            AuthorizeError::Page(OAuthError::new(
                OAuthErrorCode::InvalidRedirectUri,
                "redirect_uri is not registered for this client",
            ))
        })?
        .to_string();

    let validated = validate_protocol(params, &client).map_err(|error| {
        debug!(error = %error, "Authorization request rejected");
        let response_mode = params
            .response_mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(ResponseMode::Query);
        AuthorizeError::Redirect(RedirectError {
            redirect_uri: redirect_uri.clone(),
            response_mode,
            error,
            state: params.state.clone(),
        })
    })?;

    let session = LoginSession {
        token: generate_token(),
        tenant_id: ctx.tenant.tenant_id,
        client_pk: client.client_pk,
        response_type: "code".to_string(),
        response_mode: validated.response_mode,
        redirect_uri,
        scope: validated.scope,
        prompt: validated.prompt,
        state: params.state.clone(),
        nonce: params.nonce.clone(),
        acr_requested: validated.acr_requested,
        code_challenge: validated.code_challenge,
        code_challenge_method: validated.code_challenge_method,
        authenticated_user_id: None,
        authenticated_acr: None,
        expires_at: now + ttl,
    };
    ctx.store.create_login_session(session.clone()).await?;

    Ok((session, client))
}
