//! Keeps role-derived user permissions consistent with role membership and
//! role contents.
//!
//! Every task reduces to reconciling one `(user, role)` pair: the derived
//! rows tagged with the role must equal the role's permissions while the user
//! holds the role, and be empty otherwise. Reconciling is idempotent, so
//! duplicate or out-of-order deliveries converge to the same state.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::UserPermission;
use crate::services::events::{publish_for_user, EventSink, EventType, WebhookEvent};
use crate::services::queue::Task;
use crate::services::tenant::WorkspaceContext;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("role {0} not found")]
    RoleNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RbacError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RbacError::RoleNotFound(_) => false,
            RbacError::Store(StoreError::NotFound(_)) => false,
            RbacError::Store(_) => true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub deleted: usize,
}

impl std::ops::AddAssign for ReconcileReport {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.deleted += other.deleted;
    }
}

#[derive(Clone)]
pub struct RbacPropagator {
    events: Arc<dyn EventSink>,
}

impl RbacPropagator {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    /// Apply one RBAC task. Non-RBAC tasks are a no-op.
    #[instrument(skip(self, ws), fields(workspace_id = %ws.workspace.workspace_id, task = task.name()))]
    pub async fn handle(
        &self,
        ws: &WorkspaceContext,
        task: &Task,
    ) -> Result<ReconcileReport, RbacError> {
        match task {
            Task::RoleUpdated { role_id, .. } => {
                if ws.store.get_role(*role_id).await?.is_none() {
                    return Err(RbacError::RoleNotFound(*role_id));
                }
                let mut report = ReconcileReport::default();
                for user_id in ws.store.list_role_user_ids(*role_id).await? {
                    report += self.reconcile(ws, user_id, *role_id).await?;
                }
                Ok(report)
            }
            Task::UserRoleAssigned { user_id, role_id }
            | Task::UserRoleUnassigned { user_id, role_id } => {
                self.reconcile(ws, *user_id, *role_id).await
            }
            Task::PurgeExpired => Ok(ReconcileReport::default()),
        }
    }

    pub async fn reconcile(
        &self,
        ws: &WorkspaceContext,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<ReconcileReport, RbacError> {
        if ws.store.get_role(role_id).await?.is_none() {
            return Err(RbacError::RoleNotFound(role_id));
        }

        let desired: HashSet<Uuid> = if ws.store.user_has_role(user_id, role_id).await? {
            ws.store
                .list_role_permission_ids(role_id)
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };
        let actual: HashSet<Uuid> = ws
            .store
            .list_user_permissions(user_id)
            .await?
            .into_iter()
            .filter(|p| p.from_role_id == Some(role_id))
            .map(|p| p.permission_id)
            .collect();

        let missing: Vec<Uuid> = desired.difference(&actual).copied().collect();
        let extra: Vec<Uuid> = actual.difference(&desired).copied().collect();

        let created = if missing.is_empty() {
            Vec::new()
        } else {
            ws.store
                .insert_user_permissions(user_id, &missing, Some(role_id))
                .await?
        };
        let deleted = if extra.is_empty() {
            Vec::new()
        } else {
            ws.store
                .delete_derived_user_permissions(user_id, role_id, &extra)
                .await?
        };

        for row in &created {
            self.emit(ws, EventType::UserPermissionCreated, row).await;
        }
        for row in &deleted {
            self.emit(ws, EventType::UserPermissionDeleted, row).await;
        }

        let report = ReconcileReport {
            created: created.len(),
            deleted: deleted.len(),
        };
        debug!(user_id = %user_id, role_id = %role_id, ?report, "Derived permissions reconciled");
        Ok(report)
    }

    async fn emit(&self, ws: &WorkspaceContext, event_type: EventType, row: &UserPermission) {
        let payload = serde_json::json!({
            "user_id": row.user_id,
            "permission_id": row.permission_id,
            "from_role_id": row.from_role_id,
        });
        publish_for_user(
            self.events.as_ref(),
            ws.store.as_ref(),
            row.user_id,
            WebhookEvent::new(event_type, ws.workspace.workspace_id, row.user_id, payload),
        )
        .await;
    }
}
