use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{CreateClientRequest, CreateClientResponse},
        ErrorResponse,
    },
    middleware::CurrentWorkspace,
    services::{
        admin::{ClientLifetimes, NewClient},
        error::ServiceError,
    },
    utils::ValidatedJson,
    AppState,
};

/// Register an OAuth client for a tenant
#[utoipa::path(
    post,
    path = "/admin/tenants/{tenant_id}/clients",
    params(
        ("tenant_id" = Uuid, Path, description = "Owning tenant")
    ),
    request_body = CreateClientRequest,
    responses(
        (status = 201, description = "Client created successfully", body = CreateClientResponse),
        (status = 400, description = "Malformed encryption key", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_client(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateClientRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let request = NewClient {
        name: req.name,
        client_type: req.client_type,
        redirect_uris: req.redirect_uris,
        first_party: req.first_party,
        encrypt_jwk: req.encrypt_jwk,
        lifetimes: ClientLifetimes {
            authorization_code_seconds: req.authorization_code_lifetime_seconds,
            access_id_token_seconds: req.access_id_token_lifetime_seconds,
            refresh_token_seconds: req.refresh_token_lifetime_seconds,
        },
    };
    let (client, client_secret) = state.admin.create_client(&ws, tenant_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateClientResponse {
            client_pk: client.client_pk,
            client_id: client.client_id,
            client_secret,
            name: client.name,
            client_type: client.client_type,
            redirect_uris: client.redirect_uris,
        }),
    ))
}
