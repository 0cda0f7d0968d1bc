use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{
            AddUserPermissionRequest, CreateUserRequest, MembershipResponse,
            UserPermissionsResponse,
        },
        ErrorResponse,
    },
    middleware::CurrentWorkspace,
    models::SanitizedUser,
    services::error::ServiceError,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Create a user in a tenant
#[utoipa::path(
    post,
    path = "/admin/tenants/{tenant_id}/users",
    params(
        ("tenant_id" = Uuid, Path, description = "Owning tenant")
    ),
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = SanitizedUser),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse),
        (status = 409, description = "Email already registered in this tenant", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_user(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateUserRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state
        .admin
        .create_user(
            &ws,
            tenant_id,
            &req.email,
            &Password::new(req.password),
            req.email_verified,
            req.fields,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// Assign a role to a user
///
/// Derived permissions are granted asynchronously by the worker pool.
#[utoipa::path(
    put,
    path = "/admin/users/{user_id}/roles/{role_id}",
    params(
        ("user_id" = Uuid, Path, description = "User receiving the role"),
        ("role_id" = Uuid, Path, description = "Role to assign")
    ),
    responses(
        (status = 200, description = "Assignment recorded", body = MembershipResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "User or role not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn assign_role(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MembershipResponse>, ServiceError> {
    let changed = state.roles.assign_role(&ws, user_id, role_id).await?;
    Ok(Json(MembershipResponse { changed }))
}

/// Remove a role from a user
#[utoipa::path(
    delete,
    path = "/admin/users/{user_id}/roles/{role_id}",
    params(
        ("user_id" = Uuid, Path, description = "User losing the role"),
        ("role_id" = Uuid, Path, description = "Role to remove")
    ),
    responses(
        (status = 200, description = "Unassignment recorded", body = MembershipResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn unassign_role(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MembershipResponse>, ServiceError> {
    let changed = state.roles.unassign_role(&ws, user_id, role_id).await?;
    Ok(Json(MembershipResponse { changed }))
}

/// Grant a permission directly to a user
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/permissions",
    params(
        ("user_id" = Uuid, Path, description = "User receiving the permission")
    ),
    request_body = AddUserPermissionRequest,
    responses(
        (status = 200, description = "Permission granted", body = MembershipResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "User or permission not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn add_user_permission(
    State(state): State<AppState>,
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<AddUserPermissionRequest>,
) -> Result<Json<MembershipResponse>, ServiceError> {
    let created = state
        .roles
        .add_user_permission(&ws, user_id, req.permission_id)
        .await?;
    Ok(Json(MembershipResponse {
        changed: created.is_some(),
    }))
}

/// Effective permission codenames of a user
#[utoipa::path(
    get,
    path = "/admin/users/{user_id}/permissions",
    params(
        ("user_id" = Uuid, Path, description = "User to inspect")
    ),
    responses(
        (status = 200, description = "Direct and role-derived permissions", body = UserPermissionsResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn list_user_permissions(
    CurrentWorkspace(ws): CurrentWorkspace,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserPermissionsResponse>, ServiceError> {
    let permissions = ws.store.list_user_permission_codenames(user_id).await?;
    Ok(Json(UserPermissionsResponse {
        user_id,
        permissions,
    }))
}
