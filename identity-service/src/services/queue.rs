//! Background task queue.
//!
//! Delivery is at-least-once: a reserved task stays in a processing list
//! until acknowledged, and tasks left there by a crashed worker are put back
//! on startup. Handlers must therefore be idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::redis::RedisService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    RoleUpdated {
        role_id: Uuid,
        added_permission_ids: Vec<Uuid>,
        removed_permission_ids: Vec<Uuid>,
    },
    UserRoleAssigned {
        user_id: Uuid,
        role_id: Uuid,
    },
    UserRoleUnassigned {
        user_id: Uuid,
        role_id: Uuid,
    },
    PurgeExpired,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::RoleUpdated { .. } => "role_updated",
            Task::UserRoleAssigned { .. } => "user_role_assigned",
            Task::UserRoleUnassigned { .. } => "user_role_unassigned",
            Task::PurgeExpired => "purge_expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Number of previous delivery attempts.
    pub attempt: u32,
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(workspace_id: Uuid, task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            attempt: 0,
            task,
            enqueued_at: Utc::now(),
        }
    }
}

/// A task handed to a worker. `receipt` identifies it for `ack`/`retry`.
#[derive(Debug, Clone)]
pub struct Reserved {
    pub envelope: TaskEnvelope,
    receipt: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), anyhow::Error>;
    /// Wait up to `timeout` for a task.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Reserved>, anyhow::Error>;
    async fn ack(&self, reserved: &Reserved) -> Result<(), anyhow::Error>;
    /// Acknowledge and schedule another attempt after `delay`.
    async fn retry(&self, reserved: Reserved, delay: Duration) -> Result<(), anyhow::Error>;
    /// Move tasks abandoned in the processing list back to the queue.
    async fn recover(&self) -> Result<u64, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

// ==================== Redis ====================

/// Moves due delayed tasks onto the ready list in one step.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('RPUSH', KEYS[2], payload)
end
return #due
"#;

/// Lists `{prefix}:tasks` (ready) and `{prefix}:processing` (reserved), plus
/// the `{prefix}:delayed` sorted set scored by due time in milliseconds.
pub struct RedisTaskQueue {
    redis: RedisService,
    blocking: Mutex<ConnectionManager>,
    tasks_key: String,
    processing_key: String,
    delayed_key: String,
}

impl RedisTaskQueue {
    pub async fn new(redis: RedisService) -> Result<Self, anyhow::Error> {
        let blocking = redis.dedicated_connection().await?;
        Ok(Self {
            tasks_key: redis.key("tasks"),
            processing_key: redis.key("processing"),
            delayed_key: redis.key("delayed"),
            blocking: Mutex::new(blocking),
            redis,
        })
    }

    async fn promote_due(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.redis.connection();
        let promoted: i64 = redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(&self.delayed_key)
            .key(&self.tasks_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to promote delayed tasks: {}", e))?;
        if promoted > 0 {
            debug!(promoted, "Delayed tasks promoted");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.connection();
        redis::cmd("RPUSH")
            .arg(&self.tasks_key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to enqueue task: {}", e))
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Reserved>, anyhow::Error> {
        self.promote_due().await?;

        let payload: Option<String> = {
            let mut conn = self.blocking.lock().await;
            redis::cmd("BLMOVE")
                .arg(&self.tasks_key)
                .arg(&self.processing_key)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout.as_secs_f64())
                .query_async(&mut *conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to reserve task: {}", e))?
        };

        let Some(payload) = payload else {
            return Ok(None);
        };
        let envelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Poison payloads would otherwise be recovered forever.
                let mut conn = self.redis.connection();
                let _: () = redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to drop undecodable task: {}", e))?;
                return Err(anyhow::anyhow!("Undecodable task payload dropped: {}", e));
            }
        };
        Ok(Some(Reserved {
            envelope,
            receipt: payload,
        }))
    }

    async fn ack(&self, reserved: &Reserved) -> Result<(), anyhow::Error> {
        let mut conn = self.redis.connection();
        redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&reserved.receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acknowledge task: {}", e))
    }

    async fn retry(&self, reserved: Reserved, delay: Duration) -> Result<(), anyhow::Error> {
        let mut next = reserved.envelope.clone();
        next.attempt += 1;
        let payload = serde_json::to_string(&next)?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.redis.connection();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(payload)
            .ignore()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&reserved.receipt)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reschedule task: {}", e))
    }

    async fn recover(&self) -> Result<u64, anyhow::Error> {
        let mut conn = self.redis.connection();
        let mut recovered = 0u64;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.tasks_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to recover tasks: {}", e))?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "Requeued tasks abandoned by a previous run");
        }
        Ok(recovered)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.redis.health_check().await
    }
}

// ==================== In-memory ====================

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<TaskEnvelope>,
    in_flight: HashMap<Uuid, TaskEnvelope>,
    delayed: Vec<(Instant, TaskEnvelope)>,
}

/// Process-local queue for tests and single-node development.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting to be reserved, including delayed ones.
    pub async fn pending(&self) -> Vec<TaskEnvelope> {
        let state = self.state.lock().await;
        state
            .ready
            .iter()
            .cloned()
            .chain(state.delayed.iter().map(|(_, e)| e.clone()))
            .collect()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

impl MemoryQueueState {
    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, e)| e));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), anyhow::Error> {
        self.state.lock().await.ready.push_back(envelope);
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Reserved>, anyhow::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(envelope) = state.ready.pop_front() {
                    state.in_flight.insert(envelope.id, envelope.clone());
                    return Ok(Some(Reserved {
                        receipt: envelope.id.to_string(),
                        envelope,
                    }));
                }
                state.next_due().map_or(deadline, |due| due.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, reserved: &Reserved) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&reserved.envelope.id);
        Ok(())
    }

    async fn retry(&self, reserved: Reserved, delay: Duration) -> Result<(), anyhow::Error> {
        let mut next = reserved.envelope;
        next.attempt += 1;
        let mut state = self.state.lock().await;
        state.in_flight.remove(&next.id);
        state.delayed.push((Instant::now() + delay, next));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn recover(&self) -> Result<u64, anyhow::Error> {
        let mut state = self.state.lock().await;
        let abandoned: Vec<TaskEnvelope> = state.in_flight.drain().map(|(_, e)| e).collect();
        let count = abandoned.len() as u64;
        for envelope in abandoned {
            state.ready.push_front(envelope);
        }
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
