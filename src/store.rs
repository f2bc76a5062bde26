//! Key-value storage for activity records and stored policies
//!
//! - `RedisActivityStore`: production backend on a redis connection manager
//! - `MemoryActivityStore`: process-local map for tests and single-node hosts
//!
//! Values are written without a TTL. An idle record has to outlive the idle
//! window, otherwise it would vanish before it could be judged expired.

use crate::error::IdleError;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Single-key string store
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Read a value, `None` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>, IdleError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), IdleError>;

    /// Delete a key; deleting an absent key succeeds
    async fn delete(&self, key: &str) -> Result<(), IdleError>;
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisActivityStore {
    redis: redis::aio::ConnectionManager,
}

impl RedisActivityStore {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    /// Connect to redis and build a store on a managed connection
    pub async fn connect(url: &str) -> Result<Self, IdleError> {
        let client = redis::Client::open(url)?;
        let redis = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl ActivityStore for RedisActivityStore {
    async fn get(&self, key: &str) -> Result<Option<String>, IdleError> {
        let mut redis = self.redis.clone();
        let value: Option<String> = redis.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), IdleError> {
        let mut redis = self.redis.clone();
        let _: () = redis.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdleError> {
        let mut redis = self.redis.clone();
        let _: () = redis.del(key).await?;
        debug!("Deleted key {}", key);
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryActivityStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn get(&self, key: &str) -> Result<Option<String>, IdleError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), IdleError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdleError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
