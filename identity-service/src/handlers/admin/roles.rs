//! Workspace-wide permissions and roles. Role changes fan out to derived
//! user permissions through the task queue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{CreatePermissionRequest, CreateRoleRequest, UpdateRoleRequest},
        ErrorResponse,
    },
    middleware::CurrentWorkspace,
    models::{Permission, Role},
    services::error::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// Create a permission
#[utoipa::path(
    post,
    path = "/admin/permissions",
    request_body = CreatePermissionRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 409, description = "Codename already exists", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_permission(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    ValidatedJson(req): ValidatedJson<CreatePermissionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let permission = state
        .roles
        .create_permission(&ws, req.name, req.codename)
        .await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

/// Create a role with an initial permission set
#[utoipa::path(
    post,
    path = "/admin/roles",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 409, description = "Role name already exists", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_role(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let role = state
        .roles
        .create_role(&ws, req.name, &req.permission_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// Add and remove permissions of a role
#[utoipa::path(
    patch,
    path = "/admin/roles/{role_id}",
    params(
        ("role_id" = Uuid, Path, description = "Role to update")
    ),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated; members are reconciled asynchronously", body = Role),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn update_role(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(role_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> Result<Json<Role>, ServiceError> {
    let role = state
        .roles
        .update_role_permissions(
            &ws,
            role_id,
            &req.add_permission_ids,
            &req.remove_permission_ids,
        )
        .await?;
    Ok(Json(role))
}

/// Delete a role
#[utoipa::path(
    delete,
    path = "/admin/roles/{role_id}",
    params(
        ("role_id" = Uuid, Path, description = "Role to delete")
    ),
    responses(
        (status = 204, description = "Role, memberships and derived permissions removed"),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn delete_role(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(role_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.roles.delete_role(&ws, role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
