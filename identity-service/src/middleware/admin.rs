//! Shared-key guard for the workspace administration routes.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use service_core::error::AppError;

use crate::utils::crypto::constant_time_eq;
use crate::AppState;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// An empty configured key locks the admin API instead of opening it.
fn key_matches(presented: Option<&str>, expected: &str) -> bool {
    match presented {
        Some(key) => !expected.is_empty() && constant_time_eq(key, expected),
        None => false,
    }
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let presented = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if key_matches(presented, &state.config.security.admin_api_key) {
        return next.run(request).await;
    }

    tracing::warn!(
        method = %request.method(),
        path = %request.uri().path(),
        key_present = presented.is_some(),
        "Rejected admin request"
    );
    AppError::Unauthorized(anyhow::anyhow!("Invalid or missing admin API key")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_matching() {
        assert!(key_matches(Some("secret"), "secret"));
        assert!(!key_matches(Some("other"), "secret"));
        assert!(!key_matches(None, "secret"));
        assert!(!key_matches(Some(""), ""));
    }
}
