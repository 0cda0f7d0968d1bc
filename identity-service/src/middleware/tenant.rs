//! Request extractors that route a request to its workspace and tenant.
//!
//! The workspace comes from the `Host` header; the tenant from an optional
//! `/{tenant_slug}` path prefix, falling back to the workspace default.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::{header, request::Parts},
};
use std::collections::HashMap;

use crate::services::error::ServiceError;
use crate::services::tenant::{TenantContext, WorkspaceContext};
use crate::AppState;

pub const TENANT_SLUG_PARAM: &str = "tenant_slug";

fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

/// Tenant addressed by the request.
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub TenantContext);

#[async_trait]
impl FromRequestParts<AppState> for CurrentTenant {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let slug = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|Path(mut params)| params.remove(TENANT_SLUG_PARAM));

        let host = request_host(parts);
        let ctx = state
            .resolver
            .resolve(host.as_deref(), slug.as_deref())
            .await?;
        Ok(CurrentTenant(ctx))
    }
}

/// Workspace addressed by the request, without selecting a tenant.
#[derive(Clone)]
pub struct CurrentWorkspace(pub WorkspaceContext);

#[async_trait]
impl FromRequestParts<AppState> for CurrentWorkspace {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let host = request_host(parts);
        let ws = state.resolver.resolve_workspace(host.as_deref()).await?;
        Ok(CurrentWorkspace(ws))
    }
}
