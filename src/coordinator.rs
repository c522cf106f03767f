//! Keeps the cached visit total close to the durable count without reading
//! the durable log on every visit.
//!
//! The default [`CachePolicy::FastIncrement`] trusts the atomic increment and
//! only goes back to the log when the increment returns 1, which is what a
//! freshly created (cold) key looks like. Reconciliation writes are plain
//! overwrites that only ever move the cache up toward the durable count, so
//! two concurrent reconciliations settle on the same value without a lock.
//! A brief under-count is possible when increments land between the log read
//! and the overwrite; the next cold start repairs it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::cache::{AggregateCache, TOTAL_VISITS_KEY};
use crate::error::{CacheError, StorageError, VisitError};
use crate::storage::EventLog;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// How the cached total is kept in line with the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Atomic increment on every visit, reconcile only when the result is 1.
    FastIncrement,
    /// Read first; on a miss recount from the log and cache the result for `ttl`.
    TtlRefresh { ttl: Duration },
}

/// Policy names as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    FastIncrement,
    TtlRefresh,
}

impl PolicyKind {
    pub fn with_ttl(self, ttl: Duration) -> CachePolicy {
        match self {
            Self::FastIncrement => CachePolicy::FastIncrement,
            Self::TtlRefresh => CachePolicy::TtlRefresh { ttl },
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast-increment" => Ok(Self::FastIncrement),
            "ttl-refresh" => Ok(Self::TtlRefresh),
            _ => anyhow::bail!(
                "unknown cache policy `{s}`, expect `fast-increment` or `ttl-refresh`"
            ),
        }
    }
}

async fn storage_op<T>(
    op: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, VisitError> {
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res.map_err(VisitError::from),
        Err(_) => Err(VisitError::Timeout { op, after }),
    }
}

async fn cache_op<T>(
    op: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    tokio::time::timeout(after, fut)
        .await
        .unwrap_or(Err(CacheError::Timeout { op, after }))
}

/// Stateless between calls: everything it knows lives in the cache and the log.
#[derive(Clone, TypedBuilder)]
pub struct Coordinator {
    log: Arc<dyn EventLog>,
    cache: Arc<dyn AggregateCache>,
    #[builder(default = CachePolicy::FastIncrement)]
    policy: CachePolicy,
    #[builder(default = TOTAL_VISITS_KEY.to_string(), setter(into))]
    key: String,
    #[builder(default = DEFAULT_IO_TIMEOUT)]
    io_timeout: Duration,
}

impl Coordinator {
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Update the cache for a visit that has already been appended and return
    /// the count to report.
    pub async fn record_and_report(&self) -> Result<u64, VisitError> {
        match self.policy {
            CachePolicy::FastIncrement => self.fast_increment().await,
            CachePolicy::TtlRefresh { ttl } => self.ttl_refresh(ttl).await,
        }
    }

    async fn fast_increment(&self) -> Result<u64, VisitError> {
        let v = match self.increment().await {
            Ok(v) => v,
            Err(err) => return self.degraded(err).await,
        };

        if v != 1 {
            tracing::debug!(count = v, "cache hit");
            return Ok(v);
        }

        // 1 is also what a just-created key returns
        let t = self.count_all().await?;
        if t > v {
            tracing::info!(durable = t, "cold cache, reconciling from visit log");
            self.fill(t, None).await;
            return Ok(t);
        }

        Ok(v)
    }

    async fn ttl_refresh(&self, ttl: Duration) -> Result<u64, VisitError> {
        let cached = cache_op("get", self.io_timeout, self.cache.get(&self.key)).await;
        match cached {
            Err(err) => self.degraded(err).await,
            Ok(None) => {
                tracing::info!("cache miss, fetching count from visit log");
                let t = self.count_all().await?;
                self.fill(t, Some(ttl)).await;
                Ok(t)
            }
            Ok(Some(_)) => {
                let v = match self.increment().await {
                    Ok(v) => v,
                    Err(err) => return self.degraded(err).await,
                };

                if v == 1 {
                    // expired between the read and the increment; the new key carries no TTL
                    let t = self.count_all().await?.max(v);
                    tracing::info!(durable = t, "cache expired mid-visit, refilling");
                    self.fill(t, Some(ttl)).await;
                    return Ok(t);
                }

                tracing::debug!(count = v, "cache hit");
                Ok(v)
            }
        }
    }

    async fn increment(&self) -> Result<u64, CacheError> {
        cache_op(
            "increment",
            self.io_timeout,
            self.cache.increment_or_create(&self.key),
        )
        .await
    }

    async fn count_all(&self) -> Result<u64, VisitError> {
        storage_op("count_all", self.io_timeout, self.log.count_all()).await
    }

    async fn fill(&self, value: u64, ttl: Option<Duration>) {
        let res = cache_op("set", self.io_timeout, self.cache.set(&self.key, value, ttl)).await;
        if let Err(err) = res {
            tracing::warn!("fail to write reconciled count {value} to cache: {err}");
        }
    }

    async fn degraded(&self, err: CacheError) -> Result<u64, VisitError> {
        tracing::warn!("{err}, counting from visit log");
        self.count_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::MemoryEventLog;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn coordinator(
        log: &Arc<MemoryEventLog>,
        cache: &Arc<MemoryCache>,
        policy: CachePolicy,
    ) -> Coordinator {
        Coordinator::builder()
            .log(log.clone() as Arc<dyn EventLog>)
            .cache(cache.clone() as Arc<dyn AggregateCache>)
            .policy(policy)
            .build()
    }

    /// Increments work, overwrites fail.
    #[derive(Default)]
    struct ReadOnlyCache(MemoryCache);

    #[async_trait::async_trait]
    impl AggregateCache for ReadOnlyCache {
        async fn increment_or_create(&self, key: &str) -> Result<u64, CacheError> {
            self.0.increment_or_create(key).await
        }

        async fn set(&self, _: &str, _: u64, _: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("read only".to_string()))
        }

        async fn get(&self, key: &str) -> Result<Option<u64>, CacheError> {
            self.0.get(key).await
        }
    }

    /// Never answers within any reasonable timeout.
    struct StalledCache {
        touched: AtomicBool,
    }

    #[async_trait::async_trait]
    impl AggregateCache for StalledCache {
        async fn increment_or_create(&self, _: &str) -> Result<u64, CacheError> {
            self.touched.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        }

        async fn set(&self, _: &str, _: u64, _: Option<Duration>) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn get(&self, _: &str) -> Result<Option<u64>, CacheError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn warm_cache_skips_log() {
        let log = Arc::new(MemoryEventLog::with_events(7));
        let cache = Arc::new(MemoryCache::new());
        cache.set(TOTAL_VISITS_KEY, 6, None).await.unwrap();

        // an offline log proves the fast path never reads it
        log.set_offline(true);
        let c = coordinator(&log, &cache, CachePolicy::FastIncrement);
        assert_eq!(c.record_and_report().await.unwrap(), 7);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(7));
    }

    #[tokio::test]
    async fn cold_cache_converges_to_durable_count() {
        let log = Arc::new(MemoryEventLog::with_events(6));
        let cache = Arc::new(MemoryCache::new());
        let c = coordinator(&log, &cache, CachePolicy::FastIncrement);

        assert_eq!(c.record_and_report().await.unwrap(), 6);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(6));
    }

    #[tokio::test]
    async fn reconciliation_never_lowers_the_cache() {
        // log behind the cache, e.g. the log read raced ahead of a slow append
        let log = Arc::new(MemoryEventLog::new());
        let cache = Arc::new(MemoryCache::new());
        let c = coordinator(&log, &cache, CachePolicy::FastIncrement);

        assert_eq!(c.record_and_report().await.unwrap(), 1);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(1));
    }

    #[tokio::test]
    async fn unreachable_cache_falls_back_to_log() {
        let log = Arc::new(MemoryEventLog::with_events(3));
        let cache = Arc::new(MemoryCache::new());
        cache.set_offline(true);

        for policy in [
            CachePolicy::FastIncrement,
            CachePolicy::TtlRefresh {
                ttl: DEFAULT_CACHE_TTL,
            },
        ] {
            let c = coordinator(&log, &cache, policy);
            assert_eq!(c.record_and_report().await.unwrap(), 3);
        }
    }

    #[tokio::test]
    async fn stalled_cache_times_out_into_degraded_mode() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::with_events(2));
        let cache = Arc::new(StalledCache {
            touched: AtomicBool::new(false),
        });
        let c = Coordinator::builder()
            .log(log)
            .cache(cache.clone() as Arc<dyn AggregateCache>)
            .io_timeout(Duration::from_millis(20))
            .build();

        assert_eq!(c.record_and_report().await.unwrap(), 2);
        assert!(cache.touched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_overwrite_still_reports_durable_count() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::with_events(10));
        let c = Coordinator::builder()
            .log(log)
            .cache(Arc::new(ReadOnlyCache::default()) as Arc<dyn AggregateCache>)
            .build();

        assert_eq!(c.record_and_report().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn log_failure_during_reconciliation_is_an_error() {
        let log = Arc::new(MemoryEventLog::with_events(4));
        let cache = Arc::new(MemoryCache::new());
        log.set_offline(true);
        let c = coordinator(&log, &cache, CachePolicy::FastIncrement);

        let err = c.record_and_report().await.unwrap_err();
        assert!(matches!(err, VisitError::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn ttl_policy_fills_on_miss_and_increments_on_hit() {
        let log = Arc::new(MemoryEventLog::with_events(5));
        let cache = Arc::new(MemoryCache::new());
        let c = coordinator(
            &log,
            &cache,
            CachePolicy::TtlRefresh {
                ttl: DEFAULT_CACHE_TTL,
            },
        );

        assert_eq!(c.record_and_report().await.unwrap(), 5);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(5));

        log.set_offline(true);
        assert_eq!(c.record_and_report().await.unwrap(), 6);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(6));
    }

    #[tokio::test]
    async fn ttl_policy_refreshes_after_expiry() {
        let log = Arc::new(MemoryEventLog::with_events(5));
        let cache = Arc::new(MemoryCache::new());
        let c = coordinator(
            &log,
            &cache,
            CachePolicy::TtlRefresh {
                ttl: Duration::from_millis(30),
            },
        );

        assert_eq!(c.record_and_report().await.unwrap(), 5);
        // drift the cache away from the log, the refresh must correct it
        cache.set(TOTAL_VISITS_KEY, 2, Some(Duration::from_millis(30))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(c.record_and_report().await.unwrap(), 5);
        assert_eq!(cache.peek(TOTAL_VISITS_KEY), Some(5));
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!(
            "fast-increment".parse::<PolicyKind>().unwrap(),
            PolicyKind::FastIncrement
        );
        assert_eq!(
            "ttl-refresh"
                .parse::<PolicyKind>()
                .unwrap()
                .with_ttl(Duration::from_secs(1)),
            CachePolicy::TtlRefresh {
                ttl: Duration::from_secs(1)
            }
        );
        assert!("lru".parse::<PolicyKind>().is_err());
    }
}
