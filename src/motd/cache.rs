//! TTL-expiring result cache with background eviction.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    entries: DashMap<K, Entry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Janitor(JoinHandle<()>);

impl Drop for Janitor {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Concurrent map whose entries expire a fixed duration after insertion.
/// A background task reclaims expired entries; reads never block on it and
/// may observe an entry for up to one eviction tick past its expiry, but
/// `get` itself re-checks expiry so stale values are never returned.
pub struct TtlCache<K, V> {
    inner: Arc<Inner<K, V>>,
    _janitor: Arc<Janitor>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _janitor: Arc::clone(&self._janitor),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and spawns its eviction task. Must be called from
    /// within a tokio runtime.
    pub fn new(evict_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(evict_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let now = Instant::now();
                let before = inner.entries.len();
                inner.entries.retain(|_, entry| entry.expires_at > now);
                let evicted = before - inner.entries.len();
                if evicted > 0 {
                    debug!(evicted, "evicted expired cache entries");
                }
            }
        });
        Self {
            inner,
            _janitor: Arc::new(Janitor(handle)),
        }
    }

    /// Non-blocking lookup; absent when there is no fresh entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.inner.entries.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.inner.entries.remove(key);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Discards every entry. Used by tests and live-reload.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_entries_hit() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1, Duration::from_secs(10));
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(3600));
        cache.insert("a", 1, Duration::from_secs(5));
        assert_eq!(cache.get(&"a"), Some(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_reclaims_expired_entries() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(1));
        cache.insert("a", 1, Duration::from_millis(100));
        cache.insert("b", 2, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;
        // let the eviction task observe the tick
        tokio::task::yield_now().await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1, Duration::from_secs(10));
        cache.insert("b", 2, Duration::from_secs(10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);
    }
}
