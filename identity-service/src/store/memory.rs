//! In-memory implementation of the workspace store.
//!
//! All state of a workspace sits behind one `tokio::sync::Mutex`, so every
//! trait method is a single critical section. That makes the atomic
//! primitives (code consumption, refresh rotation) trivially linearizable.
//! Used by tests and local development; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    ProviderError, PurgeReport, StoreError, StoreProvider, StoreResult, WorkspaceDirectory,
    WorkspaceStore,
};
use crate::db::WORKSPACE_SCHEMA_VERSION;
use crate::models::{
    AuthorizationCode, Client, Grant, LoginSession, Permission, RefreshRotation, RefreshToken,
    Role, RotatedRefreshToken, SessionToken, Tenant, TenantKey, User, UserPermission, UserRole,
    Workspace,
};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    tenant_keys: Vec<TenantKey>,
    clients: HashMap<Uuid, Client>,
    users: HashMap<Uuid, User>,
    login_sessions: HashMap<String, LoginSession>,
    authorization_codes: HashMap<String, AuthorizationCode>,
    grants: HashMap<(Uuid, Uuid), Grant>,
    refresh_tokens: HashMap<String, RefreshToken>,
    rotated_refresh_tokens: HashMap<String, RotatedRefreshToken>,
    session_tokens: HashMap<String, SessionToken>,
    permissions: HashMap<Uuid, Permission>,
    roles: HashMap<Uuid, Role>,
    role_permissions: BTreeSet<(Uuid, Uuid)>,
    user_roles: HashMap<(Uuid, Uuid), UserRole>,
    user_permissions: Vec<UserPermission>,
}

impl MemoryState {
    fn require_permissions(&self, permission_ids: &[Uuid]) -> StoreResult<()> {
        match permission_ids
            .iter()
            .find(|id| !self.permissions.contains_key(id))
        {
            Some(missing) => Err(StoreError::NotFound(format!("permission {}", missing))),
            None => Ok(()),
        }
    }

    fn keys_for(&self, tenant_id: Uuid) -> Vec<TenantKey> {
        let mut keys: Vec<TenantKey> = self
            .tenant_keys
            .iter()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            b.is_current
                .cmp(&a.is_current)
                .then(b.created_utc.cmp(&a.created_utc))
        });
        keys
    }
}

/// Store of a single workspace.
#[derive(Default)]
pub struct MemoryWorkspaceStore {
    state: Mutex<MemoryState>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tenants)
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.state.lock().await.tenants.get(&tenant_id).cloned())
    }

    async fn get_default_tenant(&self) -> StoreResult<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.values().find(|t| t.is_default).cloned())
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.values().find(|t| t.slug == slug).cloned())
    }

    async fn create_tenant(&self, tenant: Tenant, key: TenantKey) -> StoreResult<Tenant> {
        let mut state = self.state.lock().await;
        if state.tenants.values().any(|t| t.slug == tenant.slug) {
            return Err(StoreError::Conflict(format!("tenant slug {}", tenant.slug)));
        }
        if tenant.is_default && state.tenants.values().any(|t| t.is_default) {
            return Err(StoreError::Conflict("default tenant already exists".into()));
        }
        state.tenant_keys.push(TenantKey {
            tenant_id: tenant.tenant_id,
            is_current: true,
            ..key
        });
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(tenant)
    }

    async fn list_tenant_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<TenantKey>> {
        Ok(self.state.lock().await.keys_for(tenant_id))
    }

    async fn rotate_tenant_key(&self, key: TenantKey, retain: usize) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&key.tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {}", key.tenant_id)));
        }
        for existing in state
            .tenant_keys
            .iter_mut()
            .filter(|k| k.tenant_id == key.tenant_id)
        {
            existing.is_current = false;
        }
        state.tenant_keys.push(TenantKey {
            is_current: true,
            ..key.clone()
        });

        let keep: Vec<String> = state
            .keys_for(key.tenant_id)
            .into_iter()
            .take(retain + 1)
            .map(|k| k.kid)
            .collect();
        state
            .tenant_keys
            .retain(|k| k.tenant_id != key.tenant_id || keep.contains(&k.kid));
        Ok(())
    }

    async fn create_client(&self, client: Client) -> StoreResult<Client> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&client.tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {}", client.tenant_id)));
        }
        if state
            .clients
            .values()
            .any(|c| c.client_id == client.client_id)
        {
            return Err(StoreError::Conflict("client_id already registered".into()));
        }
        state.clients.insert(client.client_pk, client.clone());
        Ok(client)
    }

    async fn get_client(&self, tenant_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .get(&client_pk)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_client_by_client_id(
        &self,
        tenant_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .find(|c| c.tenant_id == tenant_id && c.client_id == client_id)
            .cloned())
    }

    async fn create_user(&self, user: User) -> StoreResult<User> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&user.tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {}", user.tenant_id)));
        }
        if state
            .users
            .values()
            .any(|u| u.tenant_id == user.tenant_id && u.email == user.email)
        {
            return Err(StoreError::Conflict(format!("email {}", user.email)));
        }
        state.users.insert(user.user_id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .get(&user_id)
            .filter(|u| u.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_user_tenant_id(&self, user_id: Uuid) -> StoreResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(|u| u.tenant_id))
    }

    async fn get_user_by_email(&self, tenant_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        let email = email.to_lowercase();
        Ok(state
            .users
            .values()
            .find(|u| u.tenant_id == tenant_id && u.email == email)
            .cloned())
    }

    async fn create_login_session(&self, session: LoginSession) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.login_sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn get_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>> {
        let state = self.state.lock().await;
        Ok(state
            .login_sessions
            .get(token)
            .filter(|s| s.tenant_id == tenant_id && s.expires_at > now)
            .cloned())
    }

    async fn update_login_session(&self, session: &LoginSession) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.login_sessions.get_mut(&session.token) {
            Some(existing) if existing.tenant_id == session.tenant_id => {
                *existing = session.clone();
                Ok(())
            }
            _ => Err(StoreError::NotFound("login session".into())),
        }
    }

    async fn delete_login_session(&self, tenant_id: Uuid, token: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .login_sessions
            .get(token)
            .is_some_and(|s| s.tenant_id == tenant_id)
        {
            state.login_sessions.remove(token);
        }
        Ok(())
    }

    async fn take_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>> {
        let mut state = self.state.lock().await;
        let live = state
            .login_sessions
            .get(token)
            .is_some_and(|s| s.tenant_id == tenant_id && s.expires_at > now);
        if !live {
            return Ok(None);
        }
        Ok(state.login_sessions.remove(token))
    }

    async fn create_authorization_code(&self, code: AuthorizationCode) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.authorization_codes.contains_key(&code.code_hash) {
            return Err(StoreError::Conflict("authorization code collision".into()));
        }
        state
            .authorization_codes
            .insert(code.code_hash.clone(), code);
        Ok(())
    }

    async fn take_authorization_code(
        &self,
        tenant_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<AuthorizationCode>> {
        let mut state = self.state.lock().await;
        let matches = state
            .authorization_codes
            .get(code_hash)
            .is_some_and(|c| c.tenant_id == tenant_id && c.expires_at > now);
        if !matches {
            return Ok(None);
        }
        Ok(state.authorization_codes.remove(code_hash))
    }

    async fn get_grant(&self, user_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Grant>> {
        let state = self.state.lock().await;
        Ok(state.grants.get(&(user_id, client_pk)).cloned())
    }

    async fn upsert_grant(&self, grant: Grant) -> StoreResult<Grant> {
        let mut state = self.state.lock().await;
        let key = (grant.user_id, grant.client_pk);
        let stored = match state.grants.get(&key) {
            Some(existing) => Grant {
                created_utc: existing.created_utc,
                ..grant
            },
            None => grant,
        };
        state.grants.insert(key, stored.clone());
        Ok(stored)
    }

    async fn create_refresh_token(&self, token: RefreshToken) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.refresh_tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_refresh_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>> {
        let state = self.state.lock().await;
        Ok(state
            .refresh_tokens
            .get(token_hash)
            .filter(|t| t.tenant_id == tenant_id && !t.is_expired_at(now))
            .cloned())
    }

    async fn list_refresh_tokens(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        client_pk: Uuid,
    ) -> StoreResult<Vec<RefreshToken>> {
        let state = self.state.lock().await;
        Ok(state
            .refresh_tokens
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id && t.user_id == user_id && t.client_pk == client_pk
            })
            .cloned()
            .collect())
    }

    async fn rotate_refresh_token(
        &self,
        tenant_id: Uuid,
        presented_hash: &str,
        client_pk: Uuid,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<RefreshRotation> {
        let mut state = self.state.lock().await;

        let live = state.refresh_tokens.get(presented_hash).is_some_and(|t| {
            t.tenant_id == tenant_id && t.client_pk == client_pk && !t.is_expired_at(now)
        });
        if live {
            let Some(consumed) = state.refresh_tokens.remove(presented_hash) else {
                return Ok(RefreshRotation::Absent);
            };
            state.rotated_refresh_tokens.insert(
                consumed.token_hash.clone(),
                RotatedRefreshToken {
                    token_hash: consumed.token_hash.clone(),
                    tenant_id: consumed.tenant_id,
                    family_id: consumed.family_id,
                    expires_at: consumed.expires_at,
                },
            );
            let successor =
                consumed.successor(successor_hash.to_string(), successor_expires_at, now);
            state
                .refresh_tokens
                .insert(successor.token_hash.clone(), successor.clone());
            return Ok(RefreshRotation::Rotated(successor));
        }

        let replayed_family = state
            .rotated_refresh_tokens
            .get(presented_hash)
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.family_id);
        match replayed_family {
            Some(family_id) => {
                let before = state.refresh_tokens.len();
                state
                    .refresh_tokens
                    .retain(|_, t| t.family_id != family_id);
                let revoked = (before - state.refresh_tokens.len()) as u64;
                Ok(RefreshRotation::Reused { family_id, revoked })
            }
            None => Ok(RefreshRotation::Absent),
        }
    }

    async fn create_session_token(&self, token: SessionToken) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.session_tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_session_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SessionToken>> {
        let state = self.state.lock().await;
        Ok(state
            .session_tokens
            .get(token_hash)
            .filter(|t| t.tenant_id == tenant_id && t.expires_at > now)
            .cloned())
    }

    async fn create_permission(&self, permission: Permission) -> StoreResult<Permission> {
        let mut state = self.state.lock().await;
        if state
            .permissions
            .values()
            .any(|p| p.codename == permission.codename)
        {
            return Err(StoreError::Conflict(format!(
                "permission {}",
                permission.codename
            )));
        }
        state
            .permissions
            .insert(permission.permission_id, permission.clone());
        Ok(permission)
    }

    async fn create_role(&self, role: Role, permission_ids: &[Uuid]) -> StoreResult<Role> {
        let mut state = self.state.lock().await;
        state.require_permissions(permission_ids)?;
        for permission_id in permission_ids {
            state.role_permissions.insert((role.role_id, *permission_id));
        }
        state.roles.insert(role.role_id, role.clone());
        Ok(role)
    }

    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>> {
        Ok(self.state.lock().await.roles.get(&role_id).cloned())
    }

    async fn delete_role(&self, role_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.roles.remove(&role_id).is_none() {
            return Ok(false);
        }
        state.role_permissions.retain(|(r, _)| *r != role_id);
        state.user_roles.retain(|(_, r), _| *r != role_id);
        state
            .user_permissions
            .retain(|p| p.from_role_id != Some(role_id));
        Ok(true)
    }

    async fn add_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {}", role_id)));
        }
        state.require_permissions(permission_ids)?;
        for permission_id in permission_ids {
            state.role_permissions.insert((role_id, *permission_id));
        }
        Ok(())
    }

    async fn remove_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {}", role_id)));
        }
        state
            .role_permissions
            .retain(|(r, p)| *r != role_id || !permission_ids.contains(p));
        Ok(())
    }

    async fn list_role_permission_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .role_permissions
            .iter()
            .filter(|(r, _)| *r == role_id)
            .map(|(_, p)| *p)
            .collect())
    }

    async fn list_role_user_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut users: Vec<Uuid> = state
            .user_roles
            .keys()
            .filter(|(_, r)| *r == role_id)
            .map(|(u, _)| *u)
            .collect();
        users.sort();
        Ok(users)
    }

    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound(format!("role {}", role_id)));
        }
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        if state.user_roles.contains_key(&(user_id, role_id)) {
            return Ok(false);
        }
        state.user_roles.insert(
            (user_id, role_id),
            UserRole {
                user_id,
                role_id,
                created_utc: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn unassign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.user_roles.remove(&(user_id, role_id)).is_some())
    }

    async fn user_has_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state.user_roles.contains_key(&(user_id, role_id)))
    }

    async fn list_user_permissions(&self, user_id: Uuid) -> StoreResult<Vec<UserPermission>> {
        let state = self.state.lock().await;
        Ok(state
            .user_permissions
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_user_permissions(
        &self,
        user_id: Uuid,
        permission_ids: &[Uuid],
        from_role_id: Option<Uuid>,
    ) -> StoreResult<Vec<UserPermission>> {
        let mut state = self.state.lock().await;
        state.require_permissions(permission_ids)?;
        let mut created = Vec::new();
        for permission_id in permission_ids {
            let exists = state.user_permissions.iter().any(|p| {
                p.user_id == user_id
                    && p.permission_id == *permission_id
                    && p.from_role_id == from_role_id
            });
            if !exists {
                let row = UserPermission::new(user_id, *permission_id, from_role_id);
                state.user_permissions.push(row.clone());
                created.push(row);
            }
        }
        Ok(created)
    }

    async fn delete_derived_user_permissions(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<Vec<UserPermission>> {
        let mut state = self.state.lock().await;
        let (removed, kept): (Vec<UserPermission>, Vec<UserPermission>) =
            std::mem::take(&mut state.user_permissions)
                .into_iter()
                .partition(|p| {
                    p.user_id == user_id
                        && p.from_role_id == Some(role_id)
                        && permission_ids.contains(&p.permission_id)
                });
        state.user_permissions = kept;
        Ok(removed)
    }

    async fn list_user_permission_codenames(&self, user_id: Uuid) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        let codenames: BTreeSet<String> = state
            .user_permissions
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| state.permissions.get(&p.permission_id))
            .map(|p| p.codename.clone())
            .collect();
        Ok(codenames.into_iter().collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<PurgeReport> {
        let mut state = self.state.lock().await;
        let mut report = PurgeReport::default();

        let before = state.login_sessions.len();
        state.login_sessions.retain(|_, s| s.expires_at > now);
        report.login_sessions = (before - state.login_sessions.len()) as u64;

        let before = state.authorization_codes.len();
        state.authorization_codes.retain(|_, c| c.expires_at > now);
        report.authorization_codes = (before - state.authorization_codes.len()) as u64;

        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| t.expires_at > now);
        report.refresh_tokens = (before - state.refresh_tokens.len()) as u64;

        let before = state.rotated_refresh_tokens.len();
        state.rotated_refresh_tokens.retain(|_, t| t.expires_at > now);
        report.rotated_refresh_tokens = (before - state.rotated_refresh_tokens.len()) as u64;

        let before = state.session_tokens.len();
        state.session_tokens.retain(|_, t| t.expires_at > now);
        report.session_tokens = (before - state.session_tokens.len()) as u64;

        Ok(report)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-memory workspace directory.
#[derive(Default)]
pub struct MemoryWorkspaceDirectory {
    workspaces: RwLock<Vec<Workspace>>,
}

impl MemoryWorkspaceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workspace: Workspace) {
        self.workspaces.write().await.push(workspace);
    }
}

#[async_trait]
impl WorkspaceDirectory for MemoryWorkspaceDirectory {
    async fn find_by_domain(&self, domain: &str) -> StoreResult<Option<Workspace>> {
        let workspaces = self.workspaces.read().await;
        Ok(workspaces.iter().find(|w| w.domain == domain).cloned())
    }

    async fn get(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>> {
        let workspaces = self.workspaces.read().await;
        Ok(workspaces
            .iter()
            .find(|w| w.workspace_id == workspace_id)
            .cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Workspace>> {
        Ok(self.workspaces.read().await.clone())
    }
}

/// Lazily creates one in-memory store per workspace. Workspaces can be
/// flagged unreachable or stale to exercise the provider error paths.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: DashMap<Uuid, Arc<MemoryWorkspaceStore>>,
    unavailable: DashSet<Uuid>,
    stale: DashSet<Uuid>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unavailable(&self, workspace_id: Uuid) {
        self.unavailable.insert(workspace_id);
    }

    pub fn mark_stale(&self, workspace_id: Uuid) {
        self.stale.insert(workspace_id);
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn store_for(
        &self,
        workspace: &Workspace,
    ) -> Result<Arc<dyn WorkspaceStore>, ProviderError> {
        if self.unavailable.contains(&workspace.workspace_id) {
            return Err(ProviderError::Unavailable(format!(
                "workspace {} is unreachable",
                workspace.workspace_id
            )));
        }
        if self.stale.contains(&workspace.workspace_id) {
            return Err(ProviderError::StaleMigration {
                expected: WORKSPACE_SCHEMA_VERSION,
                found: Some(WORKSPACE_SCHEMA_VERSION - 1),
            });
        }
        let store = self
            .stores
            .entry(workspace.workspace_id)
            .or_insert_with(|| Arc::new(MemoryWorkspaceStore::new()))
            .clone();
        Ok(store)
    }

    async fn close_all(&self) {
        self.stores.clear();
    }
}
