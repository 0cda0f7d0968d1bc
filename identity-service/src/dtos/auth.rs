use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginForm {
    #[validate(length(min = 1, message = "Email is required"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,
}

/// What a login page needs to render for the pending request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginPageResponse {
    #[schema(example = "My Web App")]
    pub client_name: String,
    #[schema(example = "Acme")]
    pub tenant_name: String,
    #[schema(example = "[\"openid\", \"email\"]")]
    pub scope: Vec<String>,
    /// Form target for the credentials.
    #[schema(example = "https://acme.example.com/login")]
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsentAction {
    Allow,
    Deny,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentForm {
    pub action: ConsentAction,
    /// Space-separated subset of the requested scope; defaults to all of it.
    #[schema(example = "openid email")]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsentPageResponse {
    pub client_name: String,
    #[schema(example = "user@example.com")]
    pub user_email: String,
    pub scope: Vec<String>,
    #[schema(example = "https://acme.example.com/consent")]
    pub action: String,
}
