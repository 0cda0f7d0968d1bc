pub mod admin;
pub mod auth;
pub mod oauth;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "cannot determine tenant")]
    pub error: String,
}

/// OAuth protocol error body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OAuthErrorResponse {
    #[schema(example = "invalid_grant")]
    pub error: String,
    pub error_description: Option<String>,
}
