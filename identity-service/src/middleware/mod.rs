pub mod admin;
pub mod tenant;

pub use admin::{admin_auth_middleware, ADMIN_API_KEY_HEADER};
pub use tenant::{CurrentTenant, CurrentWorkspace, TENANT_SLUG_PARAM};
