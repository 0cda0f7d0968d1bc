use axum::{extract::State, response::Response, Form, Json};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};

use super::{login_session_token, outcome_response};
use crate::dtos::auth::{ConsentAction, ConsentForm, ConsentPageResponse};
use crate::dtos::ErrorResponse;
use crate::middleware::CurrentTenant;
use crate::models::oauth::parse_scope;
use crate::models::{Client, LoginSession, User};
use crate::services::auth::AuthorizeOutcome;
use crate::services::error::ServiceError;
use crate::services::tenant::TenantContext;
use crate::AppState;

/// Consent is only asked of a user who has already been authenticated on
/// this login session.
async fn authenticated_session(
    state: &AppState,
    ctx: &TenantContext,
    jar: &CookieJar,
    now: DateTime<Utc>,
) -> Result<(LoginSession, Client, User), ServiceError> {
    let token = login_session_token(state, ctx, jar)?;
    let (session, client) = state.flow.get_login_session(ctx, &token, now).await?;
    let user_id = session
        .authenticated_user_id
        .ok_or_else(|| ServiceError::Invalid("login session is not authenticated".into()))?;
    let user = ctx
        .store
        .get_user(ctx.tenant.tenant_id, user_id)
        .await?
        .ok_or(ServiceError::LoginSessionExpired)?;
    Ok((session, client, user))
}

/// Describe the pending consent decision
#[utoipa::path(
    get,
    path = "/consent",
    responses(
        (status = 200, description = "Scope awaiting approval", body = ConsentPageResponse),
        (status = 400, description = "Login session expired, unknown or unauthenticated", body = ErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn consent_page(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    jar: CookieJar,
) -> Result<Json<ConsentPageResponse>, ServiceError> {
    let (session, client, user) = authenticated_session(&state, &ctx, &jar, Utc::now()).await?;
    Ok(Json(ConsentPageResponse {
        client_name: client.name,
        user_email: user.email,
        scope: session.scope,
        action: format!("{}/consent", ctx.issuer),
    }))
}

/// Allow or deny the pending request
#[utoipa::path(
    post,
    path = "/consent",
    request_body(content = ConsentForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 302, description = "Redirect to the client with a code or access_denied"),
        (status = 400, description = "Login session expired, unknown or unauthenticated", body = ErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn consent(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    jar: CookieJar,
    Form(form): Form<ConsentForm>,
) -> Result<Response, ServiceError> {
    let now = Utc::now();
    let (session, client, user) = authenticated_session(&state, &ctx, &jar, now).await?;

    let scope = form
        .scope
        .as_deref()
        .map(parse_scope)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| session.scope.clone());
    let granted = form.action == ConsentAction::Allow;

    let outcome = state
        .flow
        .consent(&ctx, &session, &client, &user, granted, &scope, now)
        .await
        .map(AuthorizeOutcome::Code);
    Ok(outcome_response(&state, &ctx, jar, outcome, now))
}
