use redis::{aio::ConnectionManager, Client};

use crate::config::RedisConfig;

/// Shared Redis handle for the task queue and the event sink.
#[derive(Clone)]
pub struct RedisService {
    client: Client,
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisService {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            client,
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A separate connection for blocking commands, which would otherwise
    /// stall everything multiplexed on the shared one.
    pub async fn dedicated_connection(&self) -> Result<ConnectionManager, anyhow::Error> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))
    }

    /// Namespaced key, e.g. `identity:tasks`.
    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}
