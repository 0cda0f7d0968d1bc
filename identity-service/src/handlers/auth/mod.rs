//! Browser-facing half of the authorization code flow.

pub mod authorize;
pub mod consent;
pub mod login;

pub use authorize::authorize;
pub use consent::{consent, consent_page};
pub use login::{login, login_page};

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};

use crate::dtos::OAuthErrorResponse;
use crate::services::auth::AuthorizeOutcome;
use crate::services::authorize::AuthorizeError;
use crate::services::error::ServiceError;
use crate::services::tenant::TenantContext;
use crate::AppState;

/// Cookies are named per tenant; tenants of a workspace share one host.
pub(crate) fn cookie_name(base: &str, ctx: &TenantContext) -> String {
    format!("{}_{}", base, ctx.tenant.slug)
}

pub(crate) fn login_session_cookie_name(state: &AppState, ctx: &TenantContext) -> String {
    cookie_name(&state.config.oidc.login_session_cookie, ctx)
}

pub(crate) fn session_cookie_name(state: &AppState, ctx: &TenantContext) -> String {
    cookie_name(&state.config.oidc.session_cookie, ctx)
}

pub(crate) fn build_cookie(
    state: &AppState,
    name: String,
    value: String,
    max_age: chrono::Duration,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(state.config.oidc.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age.num_seconds().max(0)))
        .build()
}

fn removal(name: String) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

/// The login session token carried by the request, if any.
pub(crate) fn login_session_token(
    state: &AppState,
    ctx: &TenantContext,
    jar: &CookieJar,
) -> Result<String, ServiceError> {
    jar.get(&login_session_cookie_name(state, ctx))
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ServiceError::LoginSessionExpired)
}

pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Render the next step of an authorization as an HTTP response.
pub(crate) fn outcome_response(
    state: &AppState,
    ctx: &TenantContext,
    jar: CookieJar,
    outcome: Result<AuthorizeOutcome, AuthorizeError>,
    now: DateTime<Utc>,
) -> Response {
    let login_cookie = login_session_cookie_name(state, ctx);
    match outcome {
        Ok(AuthorizeOutcome::Code(issued)) => {
            (jar.remove(removal(login_cookie)), found(&issued.location)).into_response()
        }
        Ok(AuthorizeOutcome::Login(session)) => {
            let cookie = build_cookie(state, login_cookie, session.token, session.expires_at - now);
            (jar.add(cookie), found(&format!("{}/login", ctx.issuer))).into_response()
        }
        Ok(AuthorizeOutcome::Consent(session)) => {
            let cookie = build_cookie(state, login_cookie, session.token, session.expires_at - now);
            (jar.add(cookie), found(&format!("{}/consent", ctx.issuer))).into_response()
        }
        Err(AuthorizeError::Page(error)) => {
            tracing::debug!(error = %error, "Authorization request rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(OAuthErrorResponse {
                    error: error.code.as_str().to_string(),
                    error_description: error.description,
                }),
            )
                .into_response()
        }
        Err(AuthorizeError::Redirect(redirect)) => match redirect.location() {
            Ok(location) => (jar.remove(removal(login_cookie)), found(&location)).into_response(),
            Err(e) => e.into_response(),
        },
        Err(AuthorizeError::Service(e)) => e.into_response(),
    }
}
