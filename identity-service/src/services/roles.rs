use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{Permission, Role, UserPermission};
use crate::services::error::ServiceError;
use crate::services::events::{publish, publish_for_user, EventSink, EventType, WebhookEvent};
use crate::services::queue::{Task, TaskEnvelope, TaskQueue};
use crate::services::tenant::WorkspaceContext;

/// RBAC mutations. Derived permissions are never written here; each change
/// enqueues a task for the propagator instead.
#[derive(Clone)]
pub struct RoleService {
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn EventSink>,
}

impl RoleService {
    pub fn new(queue: Arc<dyn TaskQueue>, events: Arc<dyn EventSink>) -> Self {
        Self { queue, events }
    }

    async fn enqueue(&self, ws: &WorkspaceContext, task: Task) -> Result<(), ServiceError> {
        self.queue
            .enqueue(TaskEnvelope::new(ws.workspace.workspace_id, task))
            .await
            .map_err(ServiceError::Internal)
    }

    async fn emit(
        &self,
        ws: &WorkspaceContext,
        event_type: EventType,
        object_id: Uuid,
        payload: serde_json::Value,
    ) {
        publish(
            self.events.as_ref(),
            WebhookEvent::new(event_type, ws.workspace.workspace_id, object_id, payload),
        )
        .await;
    }

    /// Membership rows have no surrogate key: the user is the object and the
    /// payload carries the row's identity.
    async fn emit_for_user(
        &self,
        ws: &WorkspaceContext,
        event_type: EventType,
        user_id: Uuid,
        payload: serde_json::Value,
    ) {
        publish_for_user(
            self.events.as_ref(),
            ws.store.as_ref(),
            user_id,
            WebhookEvent::new(event_type, ws.workspace.workspace_id, user_id, payload),
        )
        .await;
    }

    pub async fn create_permission(
        &self,
        ws: &WorkspaceContext,
        name: String,
        codename: String,
    ) -> Result<Permission, ServiceError> {
        Ok(ws
            .store
            .create_permission(Permission::new(name, codename))
            .await?)
    }

    #[instrument(skip(self, ws, permission_ids), fields(workspace_id = %ws.workspace.workspace_id))]
    pub async fn create_role(
        &self,
        ws: &WorkspaceContext,
        name: String,
        permission_ids: &[Uuid],
    ) -> Result<Role, ServiceError> {
        let role = ws.store.create_role(Role::new(name), permission_ids).await?;
        self.emit(
            ws,
            EventType::RoleCreated,
            role.role_id,
            serde_json::json!({ "name": role.name, "permission_ids": permission_ids }),
        )
        .await;
        info!(role_id = %role.role_id, "Role created");
        Ok(role)
    }

    pub async fn update_role_permissions(
        &self,
        ws: &WorkspaceContext,
        role_id: Uuid,
        added: &[Uuid],
        removed: &[Uuid],
    ) -> Result<Role, ServiceError> {
        let role = ws
            .store
            .get_role(role_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("role {}", role_id)))?;

        if !added.is_empty() {
            ws.store.add_role_permissions(role_id, added).await?;
        }
        if !removed.is_empty() {
            ws.store.remove_role_permissions(role_id, removed).await?;
        }

        self.enqueue(
            ws,
            Task::RoleUpdated {
                role_id,
                added_permission_ids: added.to_vec(),
                removed_permission_ids: removed.to_vec(),
            },
        )
        .await?;
        self.emit(
            ws,
            EventType::RoleUpdated,
            role_id,
            serde_json::json!({ "added_permission_ids": added, "removed_permission_ids": removed }),
        )
        .await;
        Ok(role)
    }

    /// Memberships and derived permissions of the role go with it.
    pub async fn delete_role(
        &self,
        ws: &WorkspaceContext,
        role_id: Uuid,
    ) -> Result<(), ServiceError> {
        if !ws.store.delete_role(role_id).await? {
            return Err(ServiceError::NotFound(format!("role {}", role_id)));
        }
        self.emit(ws, EventType::RoleDeleted, role_id, serde_json::Value::Null)
            .await;
        info!(role_id = %role_id, "Role deleted");
        Ok(())
    }

    /// Idempotent; the propagation task is enqueued on every call so a lost
    /// task can be recovered by repeating the request.
    pub async fn assign_role(
        &self,
        ws: &WorkspaceContext,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let created = ws.store.assign_user_role(user_id, role_id).await?;
        self.enqueue(ws, Task::UserRoleAssigned { user_id, role_id })
            .await?;
        if created {
            self.emit_for_user(
                ws,
                EventType::UserRoleCreated,
                user_id,
                serde_json::json!({ "user_id": user_id, "role_id": role_id }),
            )
            .await;
        }
        Ok(created)
    }

    pub async fn unassign_role(
        &self,
        ws: &WorkspaceContext,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let removed = ws.store.unassign_user_role(user_id, role_id).await?;
        self.enqueue(ws, Task::UserRoleUnassigned { user_id, role_id })
            .await?;
        if removed {
            self.emit_for_user(
                ws,
                EventType::UserRoleDeleted,
                user_id,
                serde_json::json!({ "user_id": user_id, "role_id": role_id }),
            )
            .await;
        }
        Ok(removed)
    }

    /// Direct permission, independent of any role.
    pub async fn add_user_permission(
        &self,
        ws: &WorkspaceContext,
        user_id: Uuid,
        permission_id: Uuid,
    ) -> Result<Option<UserPermission>, ServiceError> {
        let created = ws
            .store
            .insert_user_permissions(user_id, &[permission_id], None)
            .await?
            .into_iter()
            .next();
        if let Some(row) = &created {
            self.emit_for_user(
                ws,
                EventType::UserPermissionCreated,
                user_id,
                serde_json::json!({
                    "user_id": row.user_id,
                    "permission_id": row.permission_id,
                    "from_role_id": row.from_role_id,
                }),
            )
            .await;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Tenant, User, Workspace};
    use crate::services::events::MemoryEventSink;
    use crate::services::keys::testing::tenant_key;
    use crate::services::queue::MemoryTaskQueue;
    use crate::store::memory::MemoryWorkspaceStore;
    use crate::store::WorkspaceStore;

    async fn setup() -> (
        RoleService,
        WorkspaceContext,
        Arc<MemoryTaskQueue>,
        Arc<MemoryEventSink>,
        Uuid,
    ) {
        let store = Arc::new(MemoryWorkspaceStore::new());
        let tenant = Tenant::new("main".into(), "Main".into(), true);
        store
            .create_tenant(tenant.clone(), tenant_key(tenant.tenant_id, "k1"))
            .await
            .unwrap();
        let user = User::new(tenant.tenant_id, "u@example.com".into(), "x".into());
        store.create_user(user.clone()).await.unwrap();

        let queue = Arc::new(MemoryTaskQueue::new());
        let events = Arc::new(MemoryEventSink::new());
        let ws = WorkspaceContext {
            workspace: Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into()),
            store,
        };
        (
            RoleService::new(queue.clone(), events.clone()),
            ws,
            queue,
            events,
            user.user_id,
        )
    }

    #[tokio::test]
    async fn test_assign_enqueues_propagation() {
        let (service, ws, queue, events, user_id) = setup().await;
        let role = service.create_role(&ws, "viewer".into(), &[]).await.unwrap();

        assert!(service.assign_role(&ws, user_id, role.role_id).await.unwrap());
        assert!(!service.assign_role(&ws, user_id, role.role_id).await.unwrap());

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending[0].task,
            Task::UserRoleAssigned {
                user_id,
                role_id: role.role_id
            }
        );
        assert_eq!(events.of_type(EventType::UserRoleCreated).await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_role_is_not_found() {
        let (service, ws, queue, _, _) = setup().await;
        let result = service
            .update_role_permissions(&ws, Uuid::new_v4(), &[], &[])
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
        assert!(queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_role_enqueues_diff() {
        let (service, ws, queue, _, _) = setup().await;
        let perm = service
            .create_permission(&ws, "Read".into(), "castles:read".into())
            .await
            .unwrap();
        let role = service.create_role(&ws, "viewer".into(), &[]).await.unwrap();

        service
            .update_role_permissions(&ws, role.role_id, &[perm.permission_id], &[])
            .await
            .unwrap();

        assert_eq!(
            ws.store.list_role_permission_ids(role.role_id).await.unwrap(),
            vec![perm.permission_id]
        );
        let pending = queue.pending().await;
        let Task::RoleUpdated {
            added_permission_ids,
            ..
        } = &pending[0].task
        else {
            panic!("expected a role update task");
        };
        assert_eq!(added_permission_ids, &vec![perm.permission_id]);
    }
}
