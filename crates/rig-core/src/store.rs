use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Fast mutable key-value store shared by every process of a run.
pub trait CoordinationStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Atomic increment; `ttl` (re)arms the key's expiry.
    fn incr<'a>(&'a self, key: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, u64>;

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, ()>;

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Sorted-set cardinality; 0 for a missing key.
    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    /// Hash length; 0 for a missing key.
    fn hlen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn get_u64<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move {
            match self.get(key).await? {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| StoreError::NotAnInteger {
                        key: key.to_string(),
                        value,
                    }),
            }
        })
    }
}

pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| StoreError::Config("store.url is required for redis".into()))?;
            let store = RedisStore::connect(url).await?;
            store.ping().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Key names for one run.
#[derive(Debug, Clone)]
pub struct RigKeys {
    prefix: String,
    run_id: String,
    waiting_prefix: String,
    waiting_user_ids_prefix: String,
}

impl RigKeys {
    pub fn new(config: &StoreConfig, run_id: impl Into<String>) -> Self {
        Self {
            prefix: config.rig_key_prefix.clone(),
            run_id: run_id.into(),
            waiting_prefix: config.waiting_key_prefix.clone(),
            waiting_user_ids_prefix: config.waiting_user_ids_prefix.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn ready(&self) -> String {
        format!("{}:ready:{}", self.prefix, self.run_id)
    }

    pub fn open_at(&self) -> String {
        format!("{}:open_at:{}", self.prefix, self.run_id)
    }

    pub fn waiting(&self, event_id: &str) -> String {
        format!("{}{}", self.waiting_prefix, event_id)
    }

    pub fn waiting_user_ids(&self, event_id: &str) -> String {
        format!("{}{}", self.waiting_user_ids_prefix, event_id)
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, MemoryEntry>,
    collections: HashMap<String, u64>,
}

/// Single-process store for tests and in-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends the service holds `len` members under a set or hash key.
    pub fn seed_collection_len(&self, key: impl Into<String>, len: u64) {
        self.lock().collections.insert(key.into(), len);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn incr_now(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        let current = match state.values.get(key) {
            Some(entry) if entry.live(now) => {
                entry
                    .value
                    .parse::<u64>()
                    .map_err(|_| StoreError::NotAnInteger {
                        key: key.to_string(),
                        value: entry.value.clone(),
                    })?
            }
            _ => 0,
        };
        let next = current + 1;
        let expires_at = match (ttl, state.values.get(key)) {
            (Some(ttl), _) => Some(now + ttl),
            (None, Some(entry)) if entry.live(now) => entry.expires_at,
            _ => None,
        };
        state.values.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }
}

impl CoordinationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, u64> {
        Box::pin(async move { self.incr_now(key, ttl) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let state = self.lock();
            Ok(state
                .values
                .get(key)
                .filter(|e| e.live(now))
                .map(|e| e.value.clone()))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            self.lock().values.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.values.remove(key);
            state.collections.remove(key);
            Ok(())
        })
    }

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.lock().collections.get(key).copied().unwrap_or(0)) })
    }

    fn hlen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.lock().collections.get(key).copied().unwrap_or(0)) })
    }
}

/// Redis-backed store for multi-process runs.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

impl CoordinationStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            match ttl {
                Some(ttl) => {
                    let (value,): (u64,) = redis::pipe()
                        .atomic()
                        .cmd("INCR")
                        .arg(key)
                        .cmd("EXPIRE")
                        .arg(key)
                        .arg(ttl.as_secs().max(1))
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok(value)
                }
                None => {
                    let value: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
                    Ok(value)
                }
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("EX").arg(ttl.as_secs().max(1));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn hlen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: u64 = redis::cmd("HLEN").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_incr_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k", None).await.unwrap(), 1);
        assert_eq!(store.incr("k", None).await.unwrap(), 2);
        assert_eq!(store.get_u64("k").await.unwrap(), Some(2));
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr("k", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_ttl_expires() {
        let store = MemoryStore::new();
        store
            .set("open", "123", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("open").await.unwrap().as_deref(), Some("123"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("open").await.unwrap(), None);

        store.incr("ctr", Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.incr("ctr", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_non_integer() {
        let store = MemoryStore::new();
        store.set("k", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("k", None).await,
            Err(StoreError::NotAnInteger { .. })
        ));
        assert!(store.get_u64("k").await.is_err());
    }

    #[tokio::test]
    async fn test_collection_lengths() {
        let store = MemoryStore::new();
        let keys = RigKeys::new(&StoreConfig::default(), "r1");
        assert_eq!(store.zcard(&keys.waiting("evt")).await.unwrap(), 0);
        store.seed_collection_len(keys.waiting("evt"), 4);
        store.seed_collection_len(keys.waiting_user_ids("evt"), 4);
        assert_eq!(store.zcard("WAITING:evt").await.unwrap(), 4);
        assert_eq!(store.hlen("WAITING_USER_IDS:evt").await.unwrap(), 4);
    }

    #[test]
    fn test_keys_are_namespaced_by_run() {
        let keys = RigKeys::new(&StoreConfig::default(), "run-7");
        assert_eq!(keys.ready(), "RIG:ready:run-7");
        assert_eq!(keys.open_at(), "RIG:open_at:run-7");
        assert_ne!(
            keys.ready(),
            RigKeys::new(&StoreConfig::default(), "run-8").ready()
        );
    }
}
