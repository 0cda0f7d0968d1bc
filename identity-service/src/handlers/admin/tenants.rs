//! Tenant administration within the workspace addressed by the Host header.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{CreateTenantRequest, RotateKeyResponse, TenantResponse},
        ErrorResponse,
    },
    middleware::CurrentWorkspace,
    services::error::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// List tenants of the workspace
#[utoipa::path(
    get,
    path = "/admin/tenants",
    responses(
        (status = 200, description = "Tenants of the workspace", body = [TenantResponse]),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn list_tenants(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
) -> Result<Json<Vec<TenantResponse>>, ServiceError> {
    let tenants = state.admin.list_tenants(&ws).await?;
    Ok(Json(
        tenants
            .iter()
            .map(|ctx| TenantResponse::new(&ctx.tenant, ctx.issuer.clone()))
            .collect(),
    ))
}

/// Create a tenant with its first signing key
#[utoipa::path(
    post,
    path = "/admin/tenants",
    request_body = CreateTenantRequest,
    responses(
        (status = 201, description = "Tenant created", body = TenantResponse),
        (status = 400, description = "Reserved or malformed slug", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 409, description = "Slug taken or default tenant already exists", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    ValidatedJson(req): ValidatedJson<CreateTenantRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let ctx = state
        .admin
        .create_tenant(&ws, &req.slug, req.name, req.is_default, req.encrypt_jwk)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TenantResponse::new(&ctx.tenant, ctx.issuer.clone())),
    ))
}

/// Rotate the tenant's signing key
///
/// The previous keys stay published in the JWKS so tokens already issued
/// keep validating.
#[utoipa::path(
    post,
    path = "/admin/tenants/{tenant_id}/keys/rotate",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant whose key is rotated")
    ),
    responses(
        (status = 200, description = "Key rotated", body = RotateKeyResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn rotate_tenant_key(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<RotateKeyResponse>, ServiceError> {
    let kid = state.admin.rotate_tenant_key(&ws, tenant_id).await?;
    Ok(Json(RotateKeyResponse { kid }))
}
