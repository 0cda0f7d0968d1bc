//! Typed webhook events. Delivery to subscribers happens outside this
//! service; events are only appended to a Redis list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::services::redis::RedisService;
use crate::store::WorkspaceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "tenant.created")]
    TenantCreated,
    #[serde(rename = "tenant.updated")]
    TenantUpdated,
    #[serde(rename = "client.created")]
    ClientCreated,
    #[serde(rename = "role.created")]
    RoleCreated,
    #[serde(rename = "role.updated")]
    RoleUpdated,
    #[serde(rename = "role.deleted")]
    RoleDeleted,
    #[serde(rename = "user_role.created")]
    UserRoleCreated,
    #[serde(rename = "user_role.deleted")]
    UserRoleDeleted,
    #[serde(rename = "user_permission.created")]
    UserPermissionCreated,
    #[serde(rename = "user_permission.deleted")]
    UserPermissionDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub workspace_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub object_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        event_type: EventType,
        workspace_id: Uuid,
        object_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            workspace_id,
            tenant_id: None,
            object_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: WebhookEvent) -> Result<(), anyhow::Error>;
}

/// Emit and log failures. The state change an event describes has already
/// been committed, so a lost event must not fail the operation.
pub async fn publish(sink: &dyn EventSink, event: WebhookEvent) {
    let event_type = event.event_type;
    let object_id = event.object_id;
    if let Err(e) = sink.emit(event).await {
        warn!(
            event_type = ?event_type,
            object_id = %object_id,
            error = %e,
            "Failed to emit webhook event"
        );
    }
}

/// Publish an event about a user's role or permission rows, stamped with
/// the user's tenant. A failed lookup still publishes, without the tenant.
pub async fn publish_for_user(
    sink: &dyn EventSink,
    store: &dyn WorkspaceStore,
    user_id: Uuid,
    event: WebhookEvent,
) {
    let event = match store.get_user_tenant_id(user_id).await {
        Ok(Some(tenant_id)) => event.for_tenant(tenant_id),
        Ok(None) => event,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to resolve tenant for webhook event");
            event
        }
    };
    publish(sink, event).await;
}

/// Appends events to `{prefix}:webhook-events`.
pub struct RedisEventSink {
    redis: RedisService,
    key: String,
}

impl RedisEventSink {
    pub fn new(redis: RedisService) -> Self {
        Self {
            key: redis.key("webhook-events"),
            redis,
        }
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn emit(&self, event: WebhookEvent) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.redis.connection();
        redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to push webhook event: {}", e))
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<WebhookEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().await.clone()
    }

    pub async fn of_type(&self, event_type: EventType) -> Vec<WebhookEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: WebhookEvent) -> Result<(), anyhow::Error> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = WebhookEvent::new(
            EventType::UserPermissionCreated,
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::json!({}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user_permission.created");
        assert!(value.get("tenant_id").is_none());
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_type() {
        let sink = MemoryEventSink::new();
        let ws = Uuid::new_v4();
        for event_type in [EventType::RoleCreated, EventType::RoleDeleted] {
            let event = WebhookEvent::new(event_type, ws, Uuid::new_v4(), serde_json::Value::Null);
            publish(&sink, event).await;
        }

        assert_eq!(sink.events().await.len(), 2);
        assert_eq!(sink.of_type(EventType::RoleDeleted).await.len(), 1);
    }
}
