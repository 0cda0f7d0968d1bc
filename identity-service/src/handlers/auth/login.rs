use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;

use super::{build_cookie, login_session_token, outcome_response, session_cookie_name};
use crate::dtos::auth::{LoginForm, LoginPageResponse};
use crate::dtos::ErrorResponse;
use crate::middleware::CurrentTenant;
use crate::services::error::ServiceError;
use crate::utils::{Password, ValidatedForm};
use crate::AppState;

/// Describe the pending login
#[utoipa::path(
    get,
    path = "/login",
    responses(
        (status = 200, description = "Pending authorization request", body = LoginPageResponse),
        (status = 400, description = "Login session expired or unknown", body = ErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn login_page(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    jar: CookieJar,
) -> Result<Json<LoginPageResponse>, ServiceError> {
    let token = login_session_token(&state, &ctx, &jar)?;
    let (session, client) = state.flow.get_login_session(&ctx, &token, Utc::now()).await?;
    Ok(Json(LoginPageResponse {
        client_name: client.name,
        tenant_name: ctx.tenant.name.clone(),
        scope: session.scope,
        action: format!("{}/login", ctx.issuer),
    }))
}

/// Submit credentials for the pending login
#[utoipa::path(
    post,
    path = "/login",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 302, description = "Redirect to the client with a code, or to the consent page"),
        (status = 400, description = "Login session expired or unknown", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn login(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    jar: CookieJar,
    ValidatedForm(form): ValidatedForm<LoginForm>,
) -> Result<Response, ServiceError> {
    let now = Utc::now();
    let token = login_session_token(&state, &ctx, &jar)?;
    let (mut session, client) = state.flow.get_login_session(&ctx, &token, now).await?;

    let user = state
        .flow
        .authenticate_password(&ctx, &mut session, &form.email, &Password::new(form.password))
        .await?;

    let (plaintext, sso) = state.flow.create_session_token(&ctx, &user, now).await?;
    let jar = jar.add(build_cookie(
        &state,
        session_cookie_name(&state, &ctx),
        plaintext,
        sso.expires_at - now,
    ));

    let outcome = state
        .flow
        .after_authentication(&ctx, session, &client, &user, now)
        .await;
    Ok(outcome_response(&state, &ctx, jar, outcome, now).into_response())
}
