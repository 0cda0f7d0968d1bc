//! Per-workspace connection pools.
//!
//! Each workspace lives in its own PostgreSQL schema. Pools are created on
//! first use with `search_path` pinned to that schema, verified against the
//! expected migration version, and cached in a bounded LRU. The least
//! recently used pool is closed when the cache is full.

use async_trait::async_trait;
use lru::LruCache;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::WORKSPACE_SCHEMA_VERSION;
use crate::config::WorkspacePoolConfig;
use crate::models::Workspace;
use crate::store::postgres::PgWorkspaceStore;
use crate::store::{ProviderError, StoreProvider, WorkspaceStore};

pub struct PgConnectionManager {
    database_url: String,
    config: WorkspacePoolConfig,
    pools: Mutex<LruCache<Uuid, PgWorkspaceStore>>,
}

impl PgConnectionManager {
    pub fn new(database_url: String, config: WorkspacePoolConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_cached_pools).unwrap_or(NonZeroUsize::MIN);
        Self {
            database_url,
            config,
            pools: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn connect_options(&self, workspace: &Workspace) -> Result<PgConnectOptions, ProviderError> {
        if !workspace.has_valid_schema_name() {
            return Err(ProviderError::Unavailable(format!(
                "invalid schema name for workspace {}",
                workspace.workspace_id
            )));
        }
        let options = PgConnectOptions::from_str(&self.database_url)
            .map_err(|e| ProviderError::Unavailable(format!("invalid database url: {}", e)))?
            .options([("search_path", workspace.schema_name.as_str())]);
        Ok(options)
    }

    async fn open(&self, workspace: &Workspace) -> Result<PgWorkspaceStore, ProviderError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections_per_pool)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(self.config.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(300))
            .connect_with(self.connect_options(workspace)?)
            .await
            .map_err(|e| {
                ProviderError::Unavailable(format!(
                    "workspace {} unreachable: {}",
                    workspace.workspace_id, e
                ))
            })?;

        let store = PgWorkspaceStore::new(pool);
        if let Err(e) = verify_schema_version(&store).await {
            store.close().await;
            return Err(e);
        }
        Ok(store)
    }

    /// Create the workspace schema if needed and apply its migrations.
    #[instrument(skip(self, workspace), fields(workspace_id = %workspace.workspace_id))]
    pub async fn provision(&self, workspace: &Workspace) -> Result<(), ProviderError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options(workspace)?)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let result = async {
            sqlx::query(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                workspace.schema_name
            ))
            .execute(&pool)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
            sqlx::migrate!("./migrations/workspace")
                .run(&pool)
                .await
                .map_err(|e| ProviderError::Unavailable(format!("migration failed: {}", e)))
        }
        .await;

        pool.close().await;
        result?;
        info!(schema = %workspace.schema_name, "Workspace schema provisioned");
        Ok(())
    }
}

async fn verify_schema_version(store: &PgWorkspaceStore) -> Result<(), ProviderError> {
    let found: Option<i64> =
        match sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(store.pool())
            .await
        {
            Ok(version) => version,
            // 42P01: undefined_table, the schema was never migrated.
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P01") => None,
            Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
        };

    if found != Some(WORKSPACE_SCHEMA_VERSION) {
        return Err(ProviderError::StaleMigration {
            expected: WORKSPACE_SCHEMA_VERSION,
            found,
        });
    }
    Ok(())
}

#[async_trait]
impl StoreProvider for PgConnectionManager {
    async fn store_for(
        &self,
        workspace: &Workspace,
    ) -> Result<Arc<dyn WorkspaceStore>, ProviderError> {
        if let Some(store) = self.pools.lock().await.get(&workspace.workspace_id) {
            return Ok(Arc::new(store.clone()));
        }

        // Opened outside the lock so one slow workspace does not stall the rest.
        let store = self.open(workspace).await?;

        let evicted = {
            let mut pools = self.pools.lock().await;
            if let Some(existing) = pools.get(&workspace.workspace_id) {
                let existing = existing.clone();
                drop(pools);
                store.close().await;
                return Ok(Arc::new(existing));
            }
            pools.push(workspace.workspace_id, store.clone())
        };

        if let Some((workspace_id, old)) = evicted {
            info!(workspace_id = %workspace_id, "Closing evicted workspace pool");
            old.close().await;
        }

        Ok(Arc::new(store))
    }

    async fn close_all(&self) {
        let stores: Vec<PgWorkspaceStore> = {
            let mut pools = self.pools.lock().await;
            let mut drained = Vec::with_capacity(pools.len());
            while let Some((_, store)) = pools.pop_lru() {
                drained.push(store);
            }
            drained
        };
        if stores.is_empty() {
            return;
        }
        info!(count = stores.len(), "Closing workspace pools");
        for store in stores {
            store.close().await;
        }
        warn!("All workspace pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PgConnectionManager {
        PgConnectionManager::new(
            "postgres://localhost/identity".to_string(),
            WorkspacePoolConfig {
                max_cached_pools: 2,
                max_connections_per_pool: 1,
                acquire_timeout_seconds: 1,
            },
        )
    }

    #[test]
    fn test_rejects_unsafe_schema_name() {
        let workspace = Workspace::new("Evil".into(), "evil.test".into(), "x; DROP".into());
        assert!(matches!(
            manager().connect_options(&workspace),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_accepts_valid_schema_name() {
        let workspace = Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into());
        assert!(manager().connect_options(&workspace).is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_unmigrated_schema_is_stale() {
        let manager = PgConnectionManager::new(
            std::env::var("DATABASE_URL").unwrap(),
            WorkspacePoolConfig {
                max_cached_pools: 2,
                max_connections_per_pool: 1,
                acquire_timeout_seconds: 2,
            },
        );
        let workspace = Workspace::new("Empty".into(), "empty.test".into(), "public".into());
        assert!(matches!(
            manager.store_for(&workspace).await,
            Err(ProviderError::StaleMigration { .. })
        ));
    }
}
