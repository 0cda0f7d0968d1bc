//! Back-channel OAuth 2.0 endpoints: token and userinfo.

use axum::{
    extract::{rejection::FormRejection, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Form, Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::dtos::oauth::{TokenRequest, UserInfoResponse};
use crate::dtos::OAuthErrorResponse;
use crate::middleware::CurrentTenant;
use crate::services::client_auth::{authenticate_client, ClientCredentials};
use crate::services::error::{OAuthError, OAuthErrorCode, ServiceError};
use crate::services::jwt::TokenResponse;
use crate::services::tenant::TenantContext;
use crate::AppState;

const NO_STORE: [(header::HeaderName, &str); 2] = [
    (header::CACHE_CONTROL, "no-store"),
    (header::PRAGMA, "no-cache"),
];

fn oauth_failure(error: ServiceError) -> Response {
    match error.into_oauth() {
        Ok(oauth) => oauth.into_response(),
        Err(other) => other.into_response(),
    }
}

async fn grant(
    state: &AppState,
    ctx: &TenantContext,
    headers: &HeaderMap,
    request: TokenRequest,
) -> Result<TokenResponse, ServiceError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credentials = ClientCredentials::from_request(
        authorization,
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
    )?;
    let client = authenticate_client(ctx, &credentials).await?;
    let now = Utc::now();

    match request.grant_type.as_deref() {
        Some("authorization_code") => {
            let code = request
                .code
                .as_deref()
                .ok_or_else(|| OAuthError::invalid_request("code is required"))?;
            state
                .exchanger
                .exchange(
                    ctx,
                    code,
                    &client,
                    request.redirect_uri.as_deref(),
                    request.code_verifier.as_deref(),
                    now,
                )
                .await
        }
        Some("refresh_token") => {
            let refresh_token = request
                .refresh_token
                .as_deref()
                .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;
            state
                .refresher
                .refresh(ctx, refresh_token, &client, request.scope.as_deref(), now)
                .await
        }
        Some(other) => Err(OAuthError::new(
            OAuthErrorCode::UnsupportedGrantType,
            format!("grant_type '{}' is not supported", other),
        )
        .into()),
        None => Err(OAuthError::invalid_request("grant_type is required").into()),
    }
}

/// Exchange a code or refresh token for tokens
#[utoipa::path(
    post,
    path = "/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Protocol error", body = OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn token(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let request = match form {
        Ok(Form(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Malformed token request");
            return OAuthError::invalid_request("malformed request body").into_response();
        }
    };

    match grant(&state, &ctx, &headers, request).await {
        Ok(tokens) => (NO_STORE, Json(tokens)).into_response(),
        Err(e) => oauth_failure(e),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Claims about the user an access token was issued for
#[utoipa::path(
    get,
    path = "/userinfo",
    responses(
        (status = 200, description = "User claims", body = UserInfoResponse),
        (status = 401, description = "Missing or invalid access token", body = OAuthErrorResponse)
    ),
    security(("bearer_token" = [])),
    tag = "OpenID Connect"
)]
pub async fn userinfo(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, ServiceError> {
    let invalid =
        |reason: &str| ServiceError::from(OAuthError::new(OAuthErrorCode::InvalidToken, reason));

    let token = bearer_token(&headers).ok_or_else(|| invalid("bearer token required"))?;
    let claims = state.tokens.validate_access_token(&ctx, token).await?;
    if claims.tenant_id != ctx.tenant.tenant_id {
        return Err(invalid("token was issued by another tenant"));
    }
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| invalid("malformed subject"))?;

    let user = ctx
        .store
        .get_user(ctx.tenant.tenant_id, user_id)
        .await?
        .ok_or_else(|| invalid("user no longer exists"))?;

    Ok(Json(UserInfoResponse {
        sub: user.user_id,
        email: user.email,
        email_verified: user.email_verified,
        tenant_id: user.tenant_id,
        fields: user.fields,
    }))
}
