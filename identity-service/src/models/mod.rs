pub mod authorization_code;
pub mod client;
pub mod grant;
pub mod jwk;
pub mod login_session;
pub mod oauth;
pub mod refresh_token;
pub mod role;
pub mod session_token;
pub mod tenant;
pub mod user;
pub mod workspace;

pub use authorization_code::AuthorizationCode;
pub use client::{Client, ClientType};
pub use grant::Grant;
pub use jwk::{Jwk, JwkSet};
pub use login_session::{LoginSession, LoginSessionState};
pub use oauth::{Acr, CodeChallengeMethod, Prompt, ResponseMode};
pub use refresh_token::{RefreshRotation, RefreshToken, RotatedRefreshToken};
pub use role::{Permission, Role, UserPermission, UserRole};
pub use session_token::SessionToken;
pub use tenant::{Tenant, TenantKey};
pub use user::{SanitizedUser, User};
pub use workspace::Workspace;
