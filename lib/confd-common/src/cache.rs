//! A concurrent cache whose entries expire a fixed time after insertion.

use std::{future::Future, hash::Hash, num::NonZeroUsize, time::Duration};

use confd_error::GenericError;
use metrics::{counter, Counter};
use tokio::time::Instant;
use tracing::trace;

use crate::telemetry::MetricsRegistry;

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> Entry<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Builder for a [`TtlCache`].
pub struct TtlCacheBuilder {
    identifier: String,
    capacity: NonZeroUsize,
    time_to_live: Duration,
    metrics: Option<MetricsRegistry>,
}

impl TtlCacheBuilder {
    /// Creates a new `TtlCacheBuilder` with the given cache identifier.
    ///
    /// The identifier labels the cache's hit and miss counters.
    ///
    /// # Errors
    ///
    /// If the given cache identifier is empty, an error is returned.
    pub fn from_identifier<N: Into<String>>(identifier: N) -> Result<Self, GenericError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(GenericError::msg("cache identifier must not be empty"));
        }

        Ok(Self {
            identifier,
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            time_to_live: Duration::from_secs(60),
            metrics: None,
        })
    }

    /// Sets how long an entry stays valid after it was inserted.
    ///
    /// Defaults to 60 seconds.
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Sets the maximum number of entries held at once.
    ///
    /// Defaults to 4096.
    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Registers the cache's counters in the given registry.
    ///
    /// Without a registry, the counters are discarded.
    pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
        self.metrics = Some(metrics.clone());
        self
    }

    pub fn build<K, V>(self) -> TtlCache<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let (hits, misses) = match &self.metrics {
            Some(metrics) => metrics.scoped(|| {
                (
                    counter!("cache_hits_total", "cache_id" => self.identifier.clone()),
                    counter!("cache_misses_total", "cache_id" => self.identifier.clone()),
                )
            }),
            None => (Counter::noop(), Counter::noop()),
        };

        TtlCache {
            inner: quick_cache::sync::Cache::new(self.capacity.get()),
            time_to_live: self.time_to_live,
            hits,
            misses,
        }
    }
}

/// A concurrent cache with per-entry time-to-live.
///
/// Expired entries are dropped lazily, when they are next looked up.
pub struct TtlCache<K, V> {
    inner: quick_cache::sync::Cache<K, Entry<V>>,
    time_to_live: Duration,
    hits: Counter,
    misses: Counter,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Gets the value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.get(key) {
            Some(entry) if !entry.is_expired(self.time_to_live) => {
                self.hits.increment(1);
                Some(entry.value)
            }
            Some(_) => {
                trace!("Dropping expired cache entry.");
                self.inner.remove(key);
                self.misses.increment(1);
                None
            }
            None => {
                self.misses.increment(1);
                None
            }
        }
    }

    /// Inserts a value, replacing any existing entry and restarting its time-to-live.
    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, Entry::new(value));
    }

    /// Gets the value for `key`, filling it with `fill` on a miss.
    ///
    /// Concurrent callers asking for the same missing key wait for a single fill instead of each running their own.
    /// If the fill fails, the error is returned and nothing is cached; one of the waiting callers then runs its own
    /// fill.
    ///
    /// # Errors
    ///
    /// If `fill` fails, its error is returned.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &K, fill: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(entry) = self.inner.get(key) {
            if !entry.is_expired(self.time_to_live) {
                self.hits.increment(1);
                return Ok(entry.value);
            }
            trace!("Dropping expired cache entry.");
            self.inner.remove(key);
        }

        match self.inner.get_value_or_guard_async(key).await {
            Ok(entry) if !entry.is_expired(self.time_to_live) => {
                self.hits.increment(1);
                Ok(entry.value)
            }
            Ok(_) => {
                // Another caller's entry expired while this one waited.
                self.misses.increment(1);
                self.inner.remove(key);
                let value = fill().await?;
                self.insert(key.clone(), value.clone());
                Ok(value)
            }
            Err(guard) => {
                self.misses.increment(1);
                let value = fill().await?;
                let _ = guard.insert(Entry::new(value.clone()));
                Ok(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn cache(ttl: Duration) -> TtlCache<String, u32> {
        TtlCacheBuilder::from_identifier("test")
            .unwrap()
            .with_time_to_live(ttl)
            .build()
    }

    #[test]
    fn empty_cache_identifier() {
        assert!(TtlCacheBuilder::from_identifier("").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache(Duration::from_secs(1800));
        cache.insert("a".to_string(), 1);

        tokio::time::advance(Duration::from_secs(1799)).await;
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fill_runs_once_within_ttl() {
        let cache = cache(Duration::from_secs(60));
        let fills = AtomicUsize::new(0);
        let key = "http://10.0.0.3:8080/datadog/expvar".to_string();

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(&key, || async {
                    fills.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache
            .get_or_try_insert_with(&key, || async {
                fills.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(8)
            })
            .await
            .unwrap();
        assert_eq!(fills.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&key), Some(8));
    }

    #[tokio::test]
    async fn failed_fill_is_not_cached() {
        let cache = cache(Duration::from_secs(60));
        let key = "k".to_string();

        let result = cache.get_or_try_insert_with(&key, || async { Err::<u32, _>("unreachable") }).await;
        assert_eq!(result, Err("unreachable"));
        assert_eq!(cache.get(&key), None);

        let value = cache.get_or_try_insert_with(&key, || async { Ok::<_, &str>(3) }).await;
        assert_eq!(value, Ok(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fills_are_coalesced() {
        let cache = Arc::new(cache(Duration::from_secs(60)));
        let fills = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Barrier::new(8));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let fills = Arc::clone(&fills);
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                gate.wait().await;
                cache
                    .get_or_try_insert_with(&"shared".to_string(), || async {
                        fills.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ()>(11)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(11));
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counters_are_registered() {
        let metrics = MetricsRegistry::new();
        let cache: TtlCache<String, u32> = TtlCacheBuilder::from_identifier("remote_config")
            .unwrap()
            .with_metrics(&metrics)
            .build();

        cache.insert("a".to_string(), 1);
        let _ = cache.get(&"a".to_string());
        let _ = cache.get(&"b".to_string());

        assert_eq!(metrics.counter_value("cache_hits_total", &[("cache_id", "remote_config")]), Some(1));
        assert_eq!(metrics.counter_value("cache_misses_total", &[("cache_id", "remote_config")]), Some(1));
    }
}
