use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use std::fmt;
use thiserror::Error;

use crate::store::{ProviderError, StoreError};

/// OAuth 2.0 / OpenID Connect protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidRedirectUri,
    InvalidGrant,
    InvalidToken,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    LoginRequired,
    ConsentRequired,
    AccessDenied,
    ServerError,
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorCode::InvalidRequest => "invalid_request",
            OAuthErrorCode::InvalidClient => "invalid_client",
            OAuthErrorCode::InvalidRedirectUri => "invalid_redirect_uri",
            OAuthErrorCode::InvalidGrant => "invalid_grant",
            OAuthErrorCode::InvalidToken => "invalid_token",
            OAuthErrorCode::UnauthorizedClient => "unauthorized_client",
            OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorCode::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorCode::InvalidScope => "invalid_scope",
            OAuthErrorCode::LoginRequired => "login_required",
            OAuthErrorCode::ConsentRequired => "consent_required",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::ServerError => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OAuthErrorCode::InvalidClient | OAuthErrorCode::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            OAuthErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {}", .description.as_deref().unwrap_or(""))]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub description: Option<String>,
}

impl OAuthError {
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest, description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidClient, description)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidGrant, description)
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidScope, description)
    }

    pub fn server_error() -> Self {
        Self {
            code: OAuthErrorCode::ServerError,
            description: None,
        }
    }
}

#[derive(Serialize)]
struct OAuthErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<&'a str>,
}

/// JSON protocol envelope, as returned by the token and userinfo endpoints.
impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let body = Json(OAuthErrorBody {
            error: self.code.as_str(),
            error_description: self.description.as_deref(),
        });
        let mut response = (self.code.status_code(), body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        match self.code {
            OAuthErrorCode::InvalidClient => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"token\""),
                );
            }
            OAuthErrorCode::InvalidToken => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            _ => {}
        }
        response
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("cannot determine tenant")]
    TenantNotFound,

    #[error("Workspace unavailable: {0}")]
    WorkspaceUnavailable(String),

    #[error("Workspace schema at version {found:?}, expected {expected}")]
    StaleMigration { expected: i64, found: Option<i64> },

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Login session expired or unknown")]
    LoginSessionExpired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(reason) => ServiceError::WorkspaceUnavailable(reason),
            ProviderError::StaleMigration { expected, found } => {
                ServiceError::StaleMigration { expected, found }
            }
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::TenantNotFound => {
                AppError::BadRequest(anyhow::anyhow!("cannot determine tenant"))
            }
            ServiceError::WorkspaceUnavailable(e) => AppError::ServiceUnavailable(e),
            e @ ServiceError::StaleMigration { .. } => AppError::ServiceUnavailable(e.to_string()),
            ServiceError::OAuth(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::LoginSessionExpired => {
                AppError::BadRequest(anyhow::anyhow!("Login session expired or unknown"))
            }
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Invalid(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Store(StoreError::NotFound(e)) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Store(StoreError::Conflict(e)) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Store(StoreError::Unavailable(e)) => AppError::ServiceUnavailable(e),
            ServiceError::Store(StoreError::Unexpected(e)) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::OAuth(e) => e.into_response(),
            other => AppError::from(other).into_response(),
        }
    }
}

impl ServiceError {
    /// Protocol view of the error for endpoints that must answer in the
    /// OAuth envelope; infrastructure failures collapse to `server_error`.
    pub fn into_oauth(self) -> Result<OAuthError, ServiceError> {
        match self {
            ServiceError::OAuth(e) => Ok(e),
            ServiceError::Store(_) | ServiceError::Internal(_) => {
                tracing::error!(error = %self, "Token endpoint failure");
                Ok(OAuthError::server_error())
            }
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_client_is_401_with_challenge() {
        let response = OAuthError::invalid_client("bad secret").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[test]
    fn test_invalid_grant_is_400() {
        let response = OAuthError::invalid_grant("used").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_tenant_and_availability_errors_are_distinct() {
        assert_eq!(
            ServiceError::TenantNotFound.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::from(ProviderError::Unavailable("down".into()))
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::from(ProviderError::StaleMigration {
                expected: 2,
                found: Some(1)
            })
            .into_response()
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_store_failures_become_server_error() {
        let err = ServiceError::Store(StoreError::Unexpected(anyhow::anyhow!("boom")));
        assert_eq!(err.into_oauth().unwrap().code, OAuthErrorCode::ServerError);
    }
}
