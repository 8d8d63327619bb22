//! Session-scoped cache tier (spec.md's middle tier between the
//! in-process map and the durable store): the original's `OptimizedGameResolutionService`
//! keeps this tier in its Redis-backed session layer so a resolution
//! survives a process restart without hitting the durable lookup again.
//! Ported the same way: an in-memory fallback for when `REDIS_URL` isn't
//! configured, and a `redis::aio::ConnectionManager`-backed store when it
//! is — the teacher's own Redis usage (`tokio-comp`/`connection-manager`
//! features, already in Cargo.toml) is this cache, not a pub/sub channel.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Backing store for the session cache tier. `get`/`put` are the only
/// operations `GameIdResolver` needs; TTL enforcement is the
/// implementation's responsibility (checked locally for the in-memory
/// store, delegated to Redis's own expiry for the Redis store).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: &str, ttl: Duration);
}

struct SessionEntry {
    value: String,
    inserted_at: Instant,
}

/// Default store: a plain `HashMap` behind a mutex, TTL checked against
/// `Instant::now()` on read. Used when no `REDIS_URL` is configured.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() < Duration::from_secs(3600) {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    async fn put(&self, key: &str, value: &str, _ttl: Duration) {
        self.entries.lock().await.insert(
            key.to_string(),
            SessionEntry {
                value: value.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }
}

/// Redis-backed store, so the session tier is actually shared and
/// durable across process restarts the way the original's Redis session
/// layer is. `ConnectionManager` reconnects on its own, same posture as
/// the teacher's other long-lived network clients (`reqwest::Client`,
/// the sqlx pool) — built once in `main` and cloned per call.
pub struct RedisSessionStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.get::<_, Option<String>>(format!("game_id_session:{key}"))
            .await
            .unwrap_or(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: redis::RedisResult<()> = conn
            .set_ex(format!("game_id_session:{key}"), value, ttl.as_secs())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.get("g1").await, None);
        store.put("g1", "canonical-g1", Duration::from_secs(60)).await;
        assert_eq!(store.get("g1").await, Some("canonical-g1".to_string()));
    }
}
