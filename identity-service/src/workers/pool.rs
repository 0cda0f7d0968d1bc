use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::services::error::ServiceError;
use crate::services::queue::{Reserved, Task, TaskEnvelope, TaskQueue};
use crate::services::rbac::RbacPropagator;
use crate::services::tenant::TenantResolver;
use crate::store::StoreError;
use crate::workers::retry::RetryPolicy;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum TaskError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Permanent(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => TaskError::Permanent(err.to_string()),
            other => TaskError::Retryable(other.to_string()),
        }
    }
}

impl From<ServiceError> for TaskError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::StaleMigration { .. } => TaskError::Permanent(err.to_string()),
            other => TaskError::Retryable(other.to_string()),
        }
    }
}

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retrying,
    Dropped,
}

/// Pulls tasks from the queue and runs them with a bounded number of
/// concurrent workers.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    resolver: TenantResolver,
    propagator: RbacPropagator,
    retry: RetryPolicy,
    concurrency: usize,
    purge_interval: Duration,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: &WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        resolver: TenantResolver,
        propagator: RbacPropagator,
    ) -> Self {
        Self {
            queue,
            resolver,
            propagator,
            retry: RetryPolicy::from_config(config),
            concurrency: config.concurrency.max(1),
            purge_interval: config.purge_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Requeues tasks abandoned by a previous run, then spawns the workers
    /// and the purge scheduler.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.queue.recover().await {
            warn!(error = %e, "Failed to recover abandoned tasks");
        }

        info!(concurrency = self.concurrency, "Starting worker pool");

        let mut handles: Vec<JoinHandle<()>> = (0..self.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run_worker(worker_id).await })
            })
            .collect();

        let pool = self.clone();
        handles.push(tokio::spawn(async move { pool.run_purge_scheduler().await }));
        handles
    }

    pub fn shutdown(&self) {
        info!("Initiating worker pool shutdown");
        self.shutdown.cancel();
    }

    async fn run_worker(&self, worker_id: usize) {
        loop {
            let reserved = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                reserved = self.queue.reserve(POLL_TIMEOUT) => reserved,
            };

            match reserved {
                Ok(Some(reserved)) => {
                    self.process(reserved).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id, error = %e, "Failed to reserve task");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn run_purge_scheduler(&self) {
        let start = tokio::time::Instant::now() + self.purge_interval;
        let mut ticker = tokio::time::interval_at(start, self.purge_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_purge().await {
                        warn!(error = %e, "Failed to schedule expiry purge");
                    }
                }
            }
        }
    }

    /// Enqueues one expiry sweep per known workspace.
    pub async fn schedule_purge(&self) -> Result<usize, anyhow::Error> {
        let workspaces = self
            .resolver
            .directory()
            .list()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list workspaces: {}", e))?;
        for workspace in &workspaces {
            self.queue
                .enqueue(TaskEnvelope::new(workspace.workspace_id, Task::PurgeExpired))
                .await?;
        }
        debug!(workspaces = workspaces.len(), "Expiry purge scheduled");
        Ok(workspaces.len())
    }

    /// Reserve and process a single task. `None` when the queue stayed empty.
    pub async fn run_once(&self, timeout: Duration) -> Result<Option<Disposition>, anyhow::Error> {
        match self.queue.reserve(timeout).await? {
            Some(reserved) => Ok(Some(self.process(reserved).await)),
            None => Ok(None),
        }
    }

    pub async fn process(&self, reserved: Reserved) -> Disposition {
        let envelope = reserved.envelope.clone();
        let task_name = envelope.task.name();

        let disposition = match self.execute(&envelope).await {
            Ok(()) => Disposition::Completed,
            Err(TaskError::Permanent(reason)) => {
                error!(
                    task_id = %envelope.id,
                    task = task_name,
                    workspace_id = %envelope.workspace_id,
                    error = %reason,
                    "Task failed permanently, dropping"
                );
                Disposition::Dropped
            }
            Err(TaskError::Retryable(reason)) if !self.retry.allows_retry(envelope.attempt) => {
                error!(
                    task_id = %envelope.id,
                    task = task_name,
                    workspace_id = %envelope.workspace_id,
                    attempts = envelope.attempt + 1,
                    error = %reason,
                    "Task failed after max attempts"
                );
                Disposition::Dropped
            }
            Err(TaskError::Retryable(reason)) => {
                let delay = self.retry.backoff_duration(envelope.attempt);
                warn!(
                    task_id = %envelope.id,
                    task = task_name,
                    attempt = envelope.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Task failed, retrying"
                );
                return match self.queue.retry(reserved, delay).await {
                    Ok(()) => Disposition::Retrying,
                    Err(e) => {
                        // Left in the processing list; recovered on next start.
                        error!(task_id = %envelope.id, error = %e, "Failed to reschedule task");
                        Disposition::Retrying
                    }
                };
            }
        };

        if let Err(e) = self.queue.ack(&reserved).await {
            warn!(task_id = %envelope.id, error = %e, "Failed to acknowledge task");
        }
        disposition
    }

    async fn execute(&self, envelope: &TaskEnvelope) -> Result<(), TaskError> {
        let workspace = self
            .resolver
            .directory()
            .get(envelope.workspace_id)
            .await?
            .ok_or_else(|| {
                let message = format!("workspace {} no longer exists", envelope.workspace_id);
                TaskError::Permanent(message)
            })?;
        let ws = self.resolver.workspace_context(workspace).await?;

        match &envelope.task {
            Task::PurgeExpired => {
                let report = ws.store.purge_expired(Utc::now()).await?;
                if report.total() > 0 {
                    info!(
                        workspace_id = %envelope.workspace_id,
                        login_sessions = report.login_sessions,
                        authorization_codes = report.authorization_codes,
                        refresh_tokens = report.refresh_tokens,
                        rotated_refresh_tokens = report.rotated_refresh_tokens,
                        session_tokens = report.session_tokens,
                        "Expired rows purged"
                    );
                }
                Ok(())
            }
            task => {
                let report = self.propagator.handle(&ws, task).await.map_err(|e| {
                    if e.is_retryable() {
                        TaskError::Retryable(e.to_string())
                    } else {
                        TaskError::Permanent(e.to_string())
                    }
                })?;
                debug!(
                    task_id = %envelope.id,
                    created = report.created,
                    deleted = report.deleted,
                    "RBAC task applied"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Permission, Role, Tenant, User, Workspace};
    use crate::services::events::MemoryEventSink;
    use crate::services::keys::testing::tenant_key;
    use crate::services::queue::MemoryTaskQueue;
    use crate::store::memory::{MemoryStoreProvider, MemoryWorkspaceDirectory};
    use crate::store::{StoreProvider, WorkspaceStore};
    use uuid::Uuid;

    struct Fixture {
        pool: WorkerPool,
        queue: Arc<MemoryTaskQueue>,
        provider: Arc<MemoryStoreProvider>,
        workspace: Workspace,
        store: Arc<dyn WorkspaceStore>,
        user: Uuid,
        role: Uuid,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let workspace = Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into());
        let directory = Arc::new(MemoryWorkspaceDirectory::new());
        directory.insert(workspace.clone()).await;
        let provider = Arc::new(MemoryStoreProvider::new());
        let store = provider.store_for(&workspace).await.unwrap();

        let tenant = Tenant::new("main".into(), "Main".into(), true);
        store
            .create_tenant(tenant.clone(), tenant_key(tenant.tenant_id, "k1"))
            .await
            .unwrap();
        let user = User::new(tenant.tenant_id, "u@example.com".into(), "x".into());
        store.create_user(user.clone()).await.unwrap();
        let perm = store
            .create_permission(Permission::new("Read".into(), "castles:read".into()))
            .await
            .unwrap();
        let role = store
            .create_role(Role::new("viewer".into()), &[perm.permission_id])
            .await
            .unwrap();

        let queue = Arc::new(MemoryTaskQueue::new());
        let resolver = TenantResolver::new(directory, provider.clone(), "https".into());
        let pool = WorkerPool::new(
            &WorkerConfig::default(),
            queue.clone(),
            resolver,
            RbacPropagator::new(Arc::new(MemoryEventSink::new())),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            add_jitter: false,
            ..Default::default()
        });

        Fixture {
            pool,
            queue,
            provider,
            workspace,
            store,
            user: user.user_id,
            role: role.role_id,
        }
    }

    async fn enqueue(f: &Fixture, workspace_id: Uuid, task: Task) {
        f.queue
            .enqueue(TaskEnvelope::new(workspace_id, task))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_assignment_task_derives_permissions() {
        let f = fixture(3).await;
        f.store.assign_user_role(f.user, f.role).await.unwrap();
        enqueue(
            &f,
            f.workspace.workspace_id,
            Task::UserRoleAssigned {
                user_id: f.user,
                role_id: f.role,
            },
        )
        .await;

        let outcome = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Completed));
        assert_eq!(
            f.store.list_user_permission_codenames(f.user).await.unwrap(),
            vec!["castles:read".to_string()]
        );
        assert_eq!(f.queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_missing_role_is_dropped_without_retry() {
        let f = fixture(3).await;
        enqueue(
            &f,
            f.workspace.workspace_id,
            Task::UserRoleAssigned {
                user_id: f.user,
                role_id: Uuid::new_v4(),
            },
        )
        .await;

        let outcome = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Dropped));
        assert!(f.queue.pending().await.is_empty());
        assert_eq!(f.queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_dropped() {
        let f = fixture(3).await;
        enqueue(&f, Uuid::new_v4(), Task::PurgeExpired).await;

        let outcome = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Dropped));
    }

    #[tokio::test]
    async fn test_unreachable_workspace_retries_then_gives_up() {
        let f = fixture(2).await;
        f.provider.mark_unavailable(f.workspace.workspace_id);
        enqueue(&f, f.workspace.workspace_id, Task::PurgeExpired).await;

        let first = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, Some(Disposition::Retrying));
        assert_eq!(f.queue.pending().await[0].attempt, 1);

        let second = f.pool.run_once(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second, Some(Disposition::Dropped));
        assert!(f.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_workspace_is_not_retried() {
        let f = fixture(5).await;
        f.provider.mark_stale(f.workspace.workspace_id);
        enqueue(&f, f.workspace.workspace_id, Task::PurgeExpired).await;

        let outcome = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Dropped));
    }

    #[tokio::test]
    async fn test_schedule_purge_covers_every_workspace() {
        let f = fixture(3).await;
        assert_eq!(f.pool.schedule_purge().await.unwrap(), 1);
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task, Task::PurgeExpired);

        let outcome = f.pool.run_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Completed));
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let f = fixture(3).await;
        let handles = f.pool.start().await;
        f.pool.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
