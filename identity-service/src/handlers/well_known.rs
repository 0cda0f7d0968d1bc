use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::dtos::oauth::DiscoveryDocument;
use crate::middleware::CurrentTenant;
use crate::models::JwkSet;
use crate::services::error::ServiceError;
use crate::AppState;

/// Get the OpenID Provider configuration for the tenant
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    responses(
        (status = 200, description = "Discovery document", body = DiscoveryDocument),
        (status = 404, description = "Unknown tenant")
    ),
    tag = "Well-Known"
)]
pub async fn openid_configuration(CurrentTenant(ctx): CurrentTenant) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(DiscoveryDocument::for_issuer(&ctx.issuer)),
    )
}

/// Get JSON Web Key Set (JWKS)
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public JWKS returned", body = JwkSet),
        (status = 404, description = "Unknown tenant")
    ),
    tag = "Well-Known"
)]
pub async fn jwks(
    State(state): State<AppState>,
    CurrentTenant(ctx): CurrentTenant,
) -> Result<impl IntoResponse, ServiceError> {
    let jwks = state.tokens.keys().jwks(&ctx).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=300"),
        ],
        Json(jwks),
    ))
}
