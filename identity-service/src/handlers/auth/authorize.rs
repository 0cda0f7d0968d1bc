use axum::{
    extract::{Query, State},
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;

use super::{outcome_response, session_cookie_name};
use crate::dtos::OAuthErrorResponse;
use crate::middleware::CurrentTenant;
use crate::services::authorize::AuthorizationRequest;
use crate::AppState;

/// Start an authorization code flow
#[utoipa::path(
    get,
    path = "/authorize",
    params(AuthorizationRequest),
    responses(
        (status = 302, description = "Redirect to the client with a code or error, or to the login/consent page"),
        (status = 400, description = "Unknown client or unregistered redirect URI", body = OAuthErrorResponse)
    ),
    tag = "OpenID Connect"
)]
pub async fn authorize(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
    jar: CookieJar,
    Query(params): Query<AuthorizationRequest>,
) -> Response {
    let now = Utc::now();
    let outcome = async {
        let (session, client) = state.flow.begin_authorization(&ctx, &params, now).await?;
        let sso_user = match jar.get(&session_cookie_name(&state, &ctx)) {
            Some(cookie) => {
                state
                    .flow
                    .resolve_session_token(&ctx, cookie.value(), now)
                    .await?
            }
            None => None,
        };
        state
            .flow
            .continue_authorization(&ctx, session, &client, sso_user, now)
            .await
    }
    .await;

    outcome_response(&state, &ctx, jar, outcome, now)
}
