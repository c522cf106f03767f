use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::CacheError;

pub const TOTAL_VISITS_KEY: &str = "total_visits";

/// A volatile key-value store holding aggregate counters. Keys may vanish at
/// any time through eviction, expiry or restart.
#[async_trait::async_trait]
pub trait AggregateCache: Send + Sync {
    /// Atomically add one to `key`, creating it at 1 when absent. Returns the new value.
    async fn increment_or_create(&self, key: &str) -> Result<u64, CacheError>;
    /// Unconditional overwrite.
    async fn set(&self, key: &str, value: u64, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<u64>, CacheError>;
}

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisCache;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::AggregateCache;
    use crate::error::CacheError;
    use redis::{aio::ConnectionManager, AsyncCommands};
    use std::time::Duration;
    use tokio::sync::OnceCell;

    impl From<redis::RedisError> for CacheError {
        fn from(err: redis::RedisError) -> Self {
            Self::Unavailable(err.to_string())
        }
    }

    /// Redis cache. The connection manager is built on first use so that a
    /// cache which is down at startup only degrades requests instead of
    /// blocking the service; once built it reconnects on its own.
    pub struct RedisCache {
        client: redis::Client,
        conn: OnceCell<ConnectionManager>,
    }

    impl RedisCache {
        pub fn open(addr: &str) -> Result<Self, CacheError> {
            let client = redis::Client::open(addr)?;
            Ok(Self {
                client,
                conn: OnceCell::new(),
            })
        }

        async fn conn(&self) -> Result<ConnectionManager, CacheError> {
            let conn = self
                .conn
                .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
                .await?;
            Ok(conn.clone())
        }
    }

    #[async_trait::async_trait]
    impl AggregateCache for RedisCache {
        async fn increment_or_create(&self, key: &str) -> Result<u64, CacheError> {
            let mut conn = self.conn().await?;
            let value: u64 = conn.incr(key, 1).await?;
            Ok(value)
        }

        async fn set(
            &self,
            key: &str,
            value: u64,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            let mut conn = self.conn().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                // EX rejects 0
                cmd.arg("EX").arg(ttl.as_secs().max(1));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<u64>, CacheError> {
            let mut conn = self.conn().await?;
            let value: Option<u64> = conn.get(key).await?;
            Ok(value)
        }
    }

    #[test]
    fn reject_malformed_address() {
        assert!(matches!(
            RedisCache::open("not a redis url"),
            Err(CacheError::Unavailable(_))
        ));
        assert!(RedisCache::open("redis://localhost:6379").is_ok());
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache. `evict` and `set_offline` let callers model a cold or
/// unreachable cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop `key`, as an LRU eviction or a restart would.
    pub fn evict(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    /// Read `key` while ignoring the offline switch.
    pub fn peek(&self, key: &str) -> Option<u64> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value)
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache is offline".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl AggregateCache for MemoryCache {
    async fn increment_or_create(&self, key: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }
        // INCR keeps the remaining TTL
        entry.value += 1;
        Ok(entry.value)
    }

    async fn set(&self, key: &str, value: u64, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.entries()?;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let entries = self.entries()?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_creates_missing_key() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get(TOTAL_VISITS_KEY).await.unwrap(), None);
        assert_eq!(cache.increment_or_create(TOTAL_VISITS_KEY).await.unwrap(), 1);
        assert_eq!(cache.increment_or_create(TOTAL_VISITS_KEY).await.unwrap(), 2);

        cache.evict(TOTAL_VISITS_KEY);
        assert_eq!(cache.increment_or_create(TOTAL_VISITS_KEY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let cache = MemoryCache::new();
        cache
            .set(TOTAL_VISITS_KEY, 41, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(cache.increment_or_create(TOTAL_VISITS_KEY).await.unwrap(), 42);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(TOTAL_VISITS_KEY).await.unwrap(), None);
        assert_eq!(cache.increment_or_create(TOTAL_VISITS_KEY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_cache_fails_every_call() {
        let cache = MemoryCache::new();
        cache.set(TOTAL_VISITS_KEY, 3, None).await.unwrap();
        cache.set_offline(true);

        assert!(cache.get(TOTAL_VISITS_KEY).await.is_err());
        assert!(cache.increment_or_create(TOTAL_VISITS_KEY).await.is_err());
        assert!(cache.set(TOTAL_VISITS_KEY, 9, None).await.is_err());
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(3));
    }
}
