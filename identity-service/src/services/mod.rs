//! Services layer for the identity provider.
//!
//! Every tenant-facing operation takes an explicit [`TenantContext`]; admin
//! and background paths work on a [`WorkspaceContext`].

pub mod admin;
pub mod auth;
pub mod authorize;
pub mod client_auth;
pub mod error;
pub mod events;
pub mod exchange;
pub mod jwe;
pub mod jwt;
pub mod keys;
pub mod queue;
pub mod rbac;
pub mod redis;
pub mod refresh;
pub mod roles;
pub mod tenant;

pub use admin::AdminService;
pub use auth::{AuthenticationFlow, AuthorizeOutcome, IssuedCode};
pub use authorize::{AuthorizationRequest, AuthorizeError, RedirectError};
pub use client_auth::{authenticate_client, ClientCredentials};
pub use error::{OAuthError, OAuthErrorCode, ServiceError};
pub use events::{EventSink, EventType, MemoryEventSink, RedisEventSink, WebhookEvent};
pub use exchange::CodeExchanger;
pub use jwt::{TokenResponse, TokenService};
pub use keys::KeyStore;
pub use queue::{MemoryTaskQueue, RedisTaskQueue, Task, TaskEnvelope, TaskQueue};
pub use rbac::RbacPropagator;
pub use redis::RedisService;
pub use refresh::RefreshService;
pub use roles::RoleService;
pub use tenant::{TenantContext, TenantResolver, WorkspaceContext};
