//! Redis implementation of the registry store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use control_plane_core::error::{ControlPlaneError, Result};

use super::RegistryStore;

/// Registry store backed by a shared redis instance.
///
/// The connection manager reconnects on its own; every command error is
/// reported as `RegistryUnavailable` so callers can degrade reads and fail
/// writes fast.
pub struct RedisRegistryStore {
    conn: ConnectionManager,
}

impl RedisRegistryStore {
    /// Connect to redis at the given URL.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ControlPlaneError::registry(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ControlPlaneError::registry(format!("redis connect failed: {}", e)))?;
        Ok(Self { conn })
    }
}

fn registry_err(error: redis::RedisError) -> ControlPlaneError {
    ControlPlaneError::registry(error.to_string())
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    async fn set_add(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, value).await.map_err(registry_err)
    }

    async fn set_remove(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, value).await.map_err(registry_err)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(registry_err)
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(registry_err)
    }

    async fn hash_put_all(&self, key: &str, entries: &HashMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(registry_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(registry_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(registry_err)
    }

    async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(registry_err)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(registry_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(registry_err)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys(format!("{}*", prefix)).await.map_err(registry_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(registry_err)
    }
}
