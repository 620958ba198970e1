//! # Combaine Cache
//!
//! A keyed TTL cache with single-flight semantics, shared by the data
//! fetchers to coalesce concurrent lookups and amortise upstream load.
//!
//! Concurrent callers for the same missing key block on the entry's ready
//! gate while exactly one of them runs the fetch. Entries past their TTL are
//! served stale while a background refresh replaces them; a background
//! sweeper removes entries that stayed stale for too long.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// The payload kinds the cache can hold.
///
/// Reads narrow the stored variant through the typed accessors; a mismatch is
/// reported as [`CacheError::TypeMismatch`] rather than a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Bytes(Vec<u8>),
    Strings(Vec<String>),
    HostMap(HashMap<String, Vec<String>>),
}

impl CachedValue {
    fn kind(&self) -> &'static str {
        match self {
            CachedValue::Bytes(_) => "bytes",
            CachedValue::Strings(_) => "strings",
            CachedValue::HostMap(_) => "host map",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cached value for {key} is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),
}

/// Outcome recorded by the producer before the ready gate opens.
type Outcome = Result<CachedValue, Arc<anyhow::Error>>;

struct Entry {
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    expires: Instant,
    outcome: RwLock<Option<Outcome>>,
    refreshing: AtomicBool,
}

impl Entry {
    fn new(expires: Instant) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            ready_tx,
            ready_rx,
            expires,
            outcome: RwLock::new(None),
            refreshing: AtomicBool::new(false),
        })
    }

    fn publish(&self, outcome: Outcome) {
        *self.outcome.write() = Some(outcome);
        let _ = self.ready_tx.send(true);
    }

    async fn wait_ready(&self) -> Outcome {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.outcome
            .read()
            .clone()
            .unwrap_or_else(|| Err(Arc::new(anyhow::anyhow!("cache entry abandoned"))))
    }
}

struct Settings {
    ttl: Duration,
    interval: Duration,
    cleanup_after: Duration,
}

struct CacheInner {
    settings: RwLock<Settings>,
    store: RwLock<HashMap<String, Arc<Entry>>>,
}

/// Single-flight TTL cache. Cheap to clone; all clones share the store and
/// the background sweeper.
#[derive(Clone)]
pub struct TtlCache {
    inner: Arc<CacheInner>,
}

impl TtlCache {
    /// Creates the cache and starts its sweeper.
    ///
    /// The sweeper wakes every `interval` and removes entries that have been
    /// expired for longer than `cleanup_after`.
    pub fn new(ttl: Duration, interval: Duration, cleanup_after: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            settings: RwLock::new(Settings {
                ttl,
                interval,
                cleanup_after,
            }),
            store: RwLock::new(HashMap::new()),
        });

        tokio::spawn(run_sweeper(Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Re-tunes the TTL, sweep interval and cleanup horizon. The sweeper
    /// picks the new interval up on its next cycle.
    pub fn tune(&self, ttl: Duration, interval: Duration, cleanup_after: Duration) {
        let mut settings = self.inner.settings.write();
        settings.ttl = ttl;
        settings.interval = interval;
        settings.cleanup_after = cleanup_after;
    }

    /// Fetches raw bytes through the cache.
    pub async fn get_bytes<F, Fut>(&self, id: &str, key: &str, fetch: F) -> Result<Vec<u8>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, anyhow::Error>> + Send + 'static,
    {
        let value = self
            .get(id, key, move || {
                let fut = fetch();
                async move { fut.await.map(CachedValue::Bytes) }
            })
            .await?;
        match value {
            CachedValue::Bytes(data) => Ok(data),
            other => Err(type_mismatch(key, "bytes", &other)),
        }
    }

    /// Fetches a list of strings through the cache.
    pub async fn get_strings<F, Fut>(
        &self,
        id: &str,
        key: &str,
        fetch: F,
    ) -> Result<Vec<String>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<String>, anyhow::Error>> + Send + 'static,
    {
        let value = self
            .get(id, key, move || {
                let fut = fetch();
                async move { fut.await.map(CachedValue::Strings) }
            })
            .await?;
        match value {
            CachedValue::Strings(data) => Ok(data),
            other => Err(type_mismatch(key, "strings", &other)),
        }
    }

    /// Fetches a host map (group name to host list) through the cache.
    pub async fn get_host_map<F, Fut>(
        &self,
        id: &str,
        key: &str,
        fetch: F,
    ) -> Result<HashMap<String, Vec<String>>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<String, Vec<String>>, anyhow::Error>> + Send + 'static,
    {
        let value = self
            .get(id, key, move || {
                let fut = fetch();
                async move { fut.await.map(CachedValue::HostMap) }
            })
            .await?;
        match value {
            CachedValue::HostMap(data) => Ok(data),
            other => Err(type_mismatch(key, "host map", &other)),
        }
    }

    /// Single-flight lookup.
    ///
    /// The first caller for a missing key becomes the producer and runs
    /// `fetch`; everyone else awaits the ready gate and observes the
    /// producer's outcome. A failed fetch removes the entry before the gate
    /// opens so the next caller retries. An expired entry is served as-is
    /// while one background refresh is scheduled.
    pub async fn get<F, Fut>(&self, id: &str, key: &str, fetch: F) -> Result<CachedValue, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CachedValue, anyhow::Error>> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        let (entry, is_producer) = {
            let mut store = self.inner.store.write();
            match store.get(key) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let ttl = self.inner.settings.read().ttl;
                    let entry = Entry::new(Instant::now() + ttl);
                    store.insert(key.to_string(), entry.clone());
                    (entry, true)
                },
            }
        };

        if is_producer {
            // Production runs detached so a caller abandoning its wait (a
            // deadline, cancellation) cannot leave the gate closed for the
            // other waiters.
            let cache = self.clone();
            let entry = entry.clone();
            let fetch = fetch.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                let outcome = match (*fetch)().await {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        cache.remove_exact(&key, &entry);
                        Err(Arc::new(err))
                    },
                };
                entry.publish(outcome);
            });
        } else {
            debug!(session = %id, key = %key, "Using cached entry.");
        }

        let outcome = entry.wait_ready().await;

        if outcome.is_ok() && entry.expires <= Instant::now() {
            self.schedule_refresh(id, key, &entry, fetch);
        }

        outcome.map_err(CacheError::Fetch)
    }

    /// Drops the entry for `key`, if any.
    pub fn delete(&self, key: &str) {
        self.inner.store.write().remove(key);
    }

    /// Removes `key` only while it still maps to `entry`, so a concurrent
    /// replacement is left untouched.
    fn remove_exact(&self, key: &str, entry: &Arc<Entry>) {
        let mut store = self.inner.store.write();
        if let Some(current) = store.get(key) {
            if Arc::ptr_eq(current, entry) {
                store.remove(key);
            }
        }
    }

    fn schedule_refresh<F, Fut>(&self, id: &str, key: &str, entry: &Arc<Entry>, fetch: Arc<F>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CachedValue, anyhow::Error>> + Send + 'static,
    {
        if entry
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = self.clone();
        let entry = entry.clone();
        let id = id.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            match (*fetch)().await {
                Ok(value) => {
                    debug!(session = %id, key = %key, "Updated stale cached entry.");
                    let ttl = cache.inner.settings.read().ttl;
                    let fresh = Entry::new(Instant::now() + ttl);
                    fresh.publish(Ok(value));
                    cache.inner.store.write().insert(key, fresh);
                },
                Err(err) => {
                    // The stale entry stays; a later observer may retry.
                    debug!(session = %id, key = %key, error = %err, "Failed to update stale cached entry.");
                    entry.refreshing.store(false, Ordering::Release);
                },
            }
        });
    }
}

fn type_mismatch(key: &str, expected: &'static str, got: &CachedValue) -> CacheError {
    info!(key = %key, expected = expected, got = got.kind(), "Cached value type mismatch.");
    CacheError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

/// Background eviction loop.
///
/// Scans under the read lock and deletes under the write lock so readers are
/// blocked as briefly as possible. Exits when the cache is dropped.
async fn run_sweeper(inner: Weak<CacheInner>) {
    debug!("Cache sweeper started.");
    loop {
        let interval = match inner.upgrade() {
            Some(cache) => cache.settings.read().interval,
            None => return,
        };
        tokio::time::sleep(interval).await;

        let cache = match inner.upgrade() {
            Some(cache) => cache,
            None => return,
        };

        let cleanup_after = cache.settings.read().cleanup_after;
        let now = Instant::now();
        let stale: Vec<String> = cache
            .store
            .read()
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.expires) > cleanup_after)
            .map(|(key, _)| key.clone())
            .collect();

        if !stale.is_empty() {
            let mut store = cache.store.write();
            for key in stale {
                store.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn test_cache() -> TtlCache {
        TtlCache::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = TtlCache::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_bytes("test", "k", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok(b"v".to_vec())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), b"v".to_vec());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_wedge_the_key() {
        let cache = TtlCache::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        // The first caller gives up before the fetch finishes.
        let first = tokio::time::timeout(
            Duration::from_millis(50),
            cache.get_bytes("test", "k", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(b"v1".to_vec())
            }),
        )
        .await;
        assert!(first.is_err());

        // Production keeps running detached; a later caller still gets the
        // produced value instead of hanging on a gate nobody opens.
        let value = tokio::time::timeout(
            Duration::from_millis(500),
            cache.get_bytes("test", "k", || async { Ok(b"v2".to_vec()) }),
        )
        .await
        .expect("cache key must not wedge")
        .unwrap();
        assert_eq!(value, b"v1".to_vec());
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let err = cache
            .get_bytes("test", "k", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("upstream down"))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));

        let c = calls.clone();
        let data = cache
            .get_bytes("test", "k", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(b"ok".to_vec())
                }
            })
            .await
            .unwrap();
        assert_eq!(data, b"ok".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entry_served_then_refreshed() {
        let cache = TtlCache::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        let value = cache
            .get_bytes("test", "k", || async { Ok(b"v1".to_vec()) })
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Past the TTL the stale value is returned and a refresh scheduled.
        let value = cache
            .get_bytes("test", "k", || async { Ok(b"v2".to_vec()) })
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = cache
            .get_bytes("test", "k", || async { Ok(b"v3".to_vec()) })
            .await
            .unwrap();
        assert_eq!(value, b"v2".to_vec());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_value() {
        let cache = TtlCache::new(
            Duration::from_millis(50),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        cache
            .get_bytes("test", "k", || async { Ok(b"v1".to_vec()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let value = cache
            .get_bytes("test", "k", || async { Err(anyhow::anyhow!("refresh down")) })
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let value = cache
            .get_bytes("test", "k", || async { Err(anyhow::anyhow!("still down")) })
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());
    }

    #[tokio::test]
    async fn sweeper_removes_long_expired_entries() {
        let cache = TtlCache::new(
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(20),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        cache
            .get_bytes("test", "k", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(b"v".to_vec())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Two sweep intervals is enough for the entry to be gone.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.inner.store.read().is_empty());
    }

    #[tokio::test]
    async fn mismatched_type_is_an_error() {
        let cache = test_cache();

        cache
            .get_bytes("test", "k", || async { Ok(b"v".to_vec()) })
            .await
            .unwrap();

        let err = cache
            .get_strings("test", "k", || async { Ok(vec!["h".to_string()]) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));

        // Dropping the entry clears the mismatch.
        cache.delete("k");
        let strings = cache
            .get_strings("test", "k", || async { Ok(vec!["h".to_string()]) })
            .await
            .unwrap();
        assert_eq!(strings, vec!["h".to_string()]);
    }

    #[tokio::test]
    async fn tune_updates_ttl() {
        let cache = test_cache();
        cache.tune(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );

        cache
            .get_bytes("test", "k", || async { Ok(b"v1".to_vec()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Well within the tuned TTL, so no stale refresh happens.
        let value = cache
            .get_bytes("test", "k", || async { Ok(b"v2".to_vec()) })
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());
    }
}
