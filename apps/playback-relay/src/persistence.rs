#[cfg(test)]
use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use thiserror::Error;
#[cfg(test)]
use tokio::sync::Mutex;

use crate::session::StoredSession;

const KEY_PREFIX: &str = "playback-relay:session:";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable key -> session record storage used to survive restarts.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Every stored record, used once at startup for rehydration.
    async fn load_all(&self) -> Result<Vec<(String, StoredSession)>, PersistenceError>;

    async fn save(&self, id: &str, record: &StoredSession) -> Result<(), PersistenceError>;

    async fn remove(&self, id: &str) -> Result<(), PersistenceError>;
}

/// In-memory adapter backing the engine and refresh tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<String, StoredSession>>,
}

#[cfg(test)]
impl MemoryPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, id: &str) -> Option<StoredSession> {
        self.records.lock().await.get(id).cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn load_all(&self) -> Result<Vec<(String, StoredSession)>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    async fn save(&self, id: &str, record: &StoredSession) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        self.records.lock().await.remove(id);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisPersistence {
    redis: ConnectionManager,
}

impl RedisPersistence {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("failed to create redis client")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { redis })
    }
}

fn key_for(id: &str) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

fn id_for(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_PREFIX)
}

#[async_trait]
impl SessionPersistence for RedisPersistence {
    async fn load_all(&self) -> Result<Vec<(String, StoredSession)>, PersistenceError> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", KEY_PREFIX))
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
                for (key, value) in keys.iter().zip(values) {
                    let (Some(id), Some(value)) = (id_for(key), value) else {
                        continue;
                    };
                    match serde_json::from_str::<StoredSession>(&value) {
                        Ok(record) => results.push((id.to_string(), record)),
                        Err(err) => {
                            tracing::warn!(key = %key, error = %err, "skipping unreadable session record");
                        }
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(results)
    }

    async fn save(&self, id: &str, record: &StoredSession) -> Result<(), PersistenceError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(key_for(id), value).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key_for(id)).await?;
        Ok(())
    }
}
