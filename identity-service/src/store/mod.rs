//! Storage seams for the identity provider.
//!
//! `WorkspaceStore` is the repository of one workspace: every row it touches
//! lives in that workspace's own namespace, and every tenant-owned lookup is
//! additionally filtered by `tenant_id`, so a credential minted for one tenant
//! can never be read back through another tenant's context.
//!
//! Two operations carry hard concurrency requirements and are single atomic
//! primitives in every backend: [`WorkspaceStore::take_authorization_code`]
//! and [`WorkspaceStore::rotate_refresh_token`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AuthorizationCode, Client, Grant, LoginSession, Permission, RefreshRotation, RefreshToken,
    Role, SessionToken, Tenant, TenantKey, User, UserPermission, Workspace,
};

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rows removed by an expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub login_sessions: u64,
    pub authorization_codes: u64,
    pub refresh_tokens: u64,
    pub rotated_refresh_tokens: u64,
    pub session_tokens: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.login_sessions
            + self.authorization_codes
            + self.refresh_tokens
            + self.rotated_refresh_tokens
            + self.session_tokens
    }
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    // ==================== Tenants & keys ====================

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;
    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>>;
    async fn get_default_tenant(&self) -> StoreResult<Option<Tenant>>;
    async fn get_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>>;
    /// Creates the tenant together with its first signing key.
    async fn create_tenant(&self, tenant: Tenant, key: TenantKey) -> StoreResult<Tenant>;
    /// Current key first, then retired keys newest first.
    async fn list_tenant_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<TenantKey>>;
    /// Makes `key` the only current key and keeps at most `retain` retired keys.
    async fn rotate_tenant_key(&self, key: TenantKey, retain: usize) -> StoreResult<()>;

    // ==================== Clients & users ====================

    async fn create_client(&self, client: Client) -> StoreResult<Client>;
    async fn get_client(&self, tenant_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Client>>;
    async fn get_client_by_client_id(
        &self,
        tenant_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Client>>;
    async fn create_user(&self, user: User) -> StoreResult<User>;
    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn get_user_by_email(&self, tenant_id: Uuid, email: &str) -> StoreResult<Option<User>>;
    /// Tenant of a user known only by id, as on workspace-level RBAC paths.
    async fn get_user_tenant_id(&self, user_id: Uuid) -> StoreResult<Option<Uuid>>;

    // ==================== Login sessions & codes ====================

    async fn create_login_session(&self, session: LoginSession) -> StoreResult<()>;
    /// Expired sessions are reported as absent.
    async fn get_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>>;
    async fn update_login_session(&self, session: &LoginSession) -> StoreResult<()>;
    async fn delete_login_session(&self, tenant_id: Uuid, token: &str) -> StoreResult<()>;
    /// Delete-and-return a live session. Of two concurrent callers at most
    /// one receives it.
    async fn take_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>>;

    async fn create_authorization_code(&self, code: AuthorizationCode) -> StoreResult<()>;
    /// Delete-and-return in one step. Of two concurrent callers presenting
    /// the same hash, at most one receives the row.
    async fn take_authorization_code(
        &self,
        tenant_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<AuthorizationCode>>;

    // ==================== Grants ====================

    async fn get_grant(&self, user_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Grant>>;
    async fn upsert_grant(&self, grant: Grant) -> StoreResult<Grant>;

    // ==================== Refresh & session tokens ====================

    async fn create_refresh_token(&self, token: RefreshToken) -> StoreResult<()>;
    async fn get_refresh_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>>;
    async fn list_refresh_tokens(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        client_pk: Uuid,
    ) -> StoreResult<Vec<RefreshToken>>;
    /// Consumes the presented token and inserts its successor, or detects a
    /// replay of a rotated token and revokes the whole family. One transaction.
    async fn rotate_refresh_token(
        &self,
        tenant_id: Uuid,
        presented_hash: &str,
        client_pk: Uuid,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<RefreshRotation>;

    async fn create_session_token(&self, token: SessionToken) -> StoreResult<()>;
    async fn get_session_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SessionToken>>;

    // ==================== RBAC ====================

    async fn create_permission(&self, permission: Permission) -> StoreResult<Permission>;
    async fn create_role(&self, role: Role, permission_ids: &[Uuid]) -> StoreResult<Role>;
    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>>;
    async fn delete_role(&self, role_id: Uuid) -> StoreResult<bool>;
    async fn add_role_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> StoreResult<()>;
    async fn remove_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<()>;
    async fn list_role_permission_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>>;
    async fn list_role_user_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>>;
    /// Returns `true` when the membership was created by this call.
    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool>;
    /// Returns `true` when a membership was removed by this call.
    async fn unassign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool>;
    async fn user_has_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool>;
    async fn list_user_permissions(&self, user_id: Uuid) -> StoreResult<Vec<UserPermission>>;
    /// Inserts missing rows only; returns the rows actually created.
    async fn insert_user_permissions(
        &self,
        user_id: Uuid,
        permission_ids: &[Uuid],
        from_role_id: Option<Uuid>,
    ) -> StoreResult<Vec<UserPermission>>;
    /// Deletes derived rows of `(user, role)` for the given permissions;
    /// returns the rows actually removed.
    async fn delete_derived_user_permissions(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<Vec<UserPermission>>;
    /// Distinct codenames, direct and derived, sorted.
    async fn list_user_permission_codenames(&self, user_id: Uuid) -> StoreResult<Vec<String>>;

    // ==================== Maintenance ====================

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<PurgeReport>;
    async fn health_check(&self) -> StoreResult<()>;
}

/// Main-database lookup of workspaces by routing host.
#[async_trait]
pub trait WorkspaceDirectory: Send + Sync {
    async fn find_by_domain(&self, domain: &str) -> StoreResult<Option<Workspace>>;
    async fn get(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>>;
    async fn list(&self) -> StoreResult<Vec<Workspace>>;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transient: the namespace could not be reached.
    #[error("workspace storage unavailable: {0}")]
    Unavailable(String),
    /// Fail-fast: the namespace exists but is not at the expected schema version.
    #[error("workspace schema at version {found:?}, expected {expected}")]
    StaleMigration { expected: i64, found: Option<i64> },
}

/// Hands out the store of a workspace, owning whatever connections back it.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn store_for(
        &self,
        workspace: &Workspace,
    ) -> Result<Arc<dyn WorkspaceStore>, ProviderError>;
    /// Drain and close every pooled connection.
    async fn close_all(&self);
}
