//! Request routing to a workspace and one of its tenants.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{Tenant, Workspace};
use crate::services::error::ServiceError;
use crate::store::{StoreError, StoreProvider, WorkspaceDirectory, WorkspaceStore};

/// Everything a core operation needs to know about the tenant it runs for.
/// Built once per request and passed explicitly.
#[derive(Clone)]
pub struct TenantContext {
    pub workspace: Workspace,
    pub tenant: Tenant,
    pub store: Arc<dyn WorkspaceStore>,
    pub issuer: String,
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext")
            .field("workspace_id", &self.workspace.workspace_id)
            .field("tenant_id", &self.tenant.tenant_id)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// A workspace with its store but no tenant selected (admin and worker paths).
#[derive(Clone)]
pub struct WorkspaceContext {
    pub workspace: Workspace,
    pub store: Arc<dyn WorkspaceStore>,
}

#[derive(Clone)]
pub struct TenantResolver {
    directory: Arc<dyn WorkspaceDirectory>,
    provider: Arc<dyn StoreProvider>,
    scheme: String,
}

/// Lower-cased host without port. `None` for a missing or blank header.
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal: [::1]:8080
        rest.split(']').next().unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or_default()
    };
    if without_port.is_empty() {
        None
    } else {
        Some(without_port.to_ascii_lowercase())
    }
}

fn directory_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::Unavailable(reason) => ServiceError::WorkspaceUnavailable(reason),
        other => ServiceError::Store(other),
    }
}

impl TenantResolver {
    pub fn new(
        directory: Arc<dyn WorkspaceDirectory>,
        provider: Arc<dyn StoreProvider>,
        scheme: String,
    ) -> Self {
        Self {
            directory,
            provider,
            scheme,
        }
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    pub fn directory(&self) -> &Arc<dyn WorkspaceDirectory> {
        &self.directory
    }

    pub async fn workspace_context(
        &self,
        workspace: Workspace,
    ) -> Result<WorkspaceContext, ServiceError> {
        let store = self.provider.store_for(&workspace).await.map_err(|e| {
            warn!(
                workspace_id = %workspace.workspace_id,
                error = %e,
                "Workspace store unavailable"
            );
            ServiceError::from(e)
        })?;
        Ok(WorkspaceContext { workspace, store })
    }

    pub async fn resolve_workspace(
        &self,
        host: Option<&str>,
    ) -> Result<WorkspaceContext, ServiceError> {
        let domain = host
            .and_then(normalize_host)
            .ok_or(ServiceError::TenantNotFound)?;

        let workspace = self
            .directory
            .find_by_domain(&domain)
            .await
            .map_err(directory_error)?
            .ok_or_else(|| {
                debug!(domain = %domain, "No workspace for host");
                ServiceError::TenantNotFound
            })?;

        self.workspace_context(workspace).await
    }

    /// Without a slug the workspace's default tenant is selected.
    pub async fn resolve(
        &self,
        host: Option<&str>,
        tenant_slug: Option<&str>,
    ) -> Result<TenantContext, ServiceError> {
        let WorkspaceContext { workspace, store } = self.resolve_workspace(host).await?;

        let tenant = match tenant_slug {
            Some(slug) => store.get_tenant_by_slug(&slug.to_lowercase()).await?,
            None => store.get_default_tenant().await?,
        }
        .ok_or(ServiceError::TenantNotFound)?;

        let issuer = tenant.issuer(&self.scheme, &workspace.domain);
        Ok(TenantContext {
            workspace,
            tenant,
            store,
            issuer,
        })
    }

    /// Context for a tenant addressed by id (workspace-scoped admin calls).
    pub fn tenant_context(&self, ws: &WorkspaceContext, tenant: Tenant) -> TenantContext {
        let issuer = tenant.issuer(&self.scheme, &ws.workspace.domain);
        TenantContext {
            workspace: ws.workspace.clone(),
            tenant,
            store: ws.store.clone(),
            issuer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantKey;
    use crate::store::memory::{MemoryStoreProvider, MemoryWorkspaceDirectory};
    use chrono::Utc;

    async fn setup() -> (TenantResolver, Arc<MemoryStoreProvider>, Workspace) {
        let directory = Arc::new(MemoryWorkspaceDirectory::new());
        let provider = Arc::new(MemoryStoreProvider::new());
        let workspace = Workspace::new("Acme".into(), "Acme.Test".into(), "ws_acme".into());
        directory.insert(workspace.clone()).await;

        let store = provider.store_for(&workspace).await.unwrap();
        for (slug, is_default) in [("main", true), ("beta", false)] {
            let tenant = Tenant::new(slug.into(), slug.into(), is_default);
            let key = TenantKey {
                kid: format!("kid-{}", slug),
                tenant_id: tenant.tenant_id,
                private_key_pem: String::new(),
                is_current: true,
                created_utc: Utc::now(),
            };
            store.create_tenant(tenant, key).await.unwrap();
        }

        let resolver = TenantResolver::new(directory, provider.clone(), "https".into());
        (resolver, provider, workspace)
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Acme.Test:8443").as_deref(), Some("acme.test"));
        assert_eq!(normalize_host("[::1]:8080").as_deref(), Some("::1"));
        assert_eq!(normalize_host("  "), None);
    }

    #[tokio::test]
    async fn test_resolves_default_and_slug_tenants() {
        let (resolver, _, _) = setup().await;

        let default = resolver.resolve(Some("acme.test"), None).await.unwrap();
        assert!(default.tenant.is_default);
        assert_eq!(default.issuer, "https://acme.test");

        let beta = resolver.resolve(Some("acme.test:443"), Some("BETA")).await.unwrap();
        assert_eq!(beta.tenant.slug, "beta");
        assert_eq!(beta.issuer, "https://acme.test/beta");
    }

    #[tokio::test]
    async fn test_unknown_host_or_slug_is_tenant_not_found() {
        let (resolver, _, _) = setup().await;

        assert!(matches!(
            resolver.resolve(None, None).await,
            Err(ServiceError::TenantNotFound)
        ));
        assert!(matches!(
            resolver.resolve(Some("other.test"), None).await,
            Err(ServiceError::TenantNotFound)
        ));
        assert!(matches!(
            resolver.resolve(Some("acme.test"), Some("gamma")).await,
            Err(ServiceError::TenantNotFound)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_workspace_is_unavailable() {
        let (resolver, provider, workspace) = setup().await;
        provider.mark_unavailable(workspace.workspace_id);

        assert!(matches!(
            resolver.resolve(Some("acme.test"), None).await,
            Err(ServiceError::WorkspaceUnavailable(_))
        ));
    }
}
