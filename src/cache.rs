//! Ephemeral result cache
//!
//! Time-boxed cache for expensive, idempotent query results (job search). Expiry is
//! checked when reading: an entry older than the TTL is treated as absent even though it
//! still physically exists. Nothing evicts in the background; [`EphemeralCache::purge_expired`]
//! is available for explicit housekeeping.
//!
//! Compiled documents never go through this cache.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::CacheConfig;

/// A cached payload and when it was stored
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    /// Cache key
    pub key: String,
    /// Cached value
    pub payload: V,
    /// When the value was stored
    pub stored_at: Instant,
}

/// Session-scoped TTL cache, shareable across consumers behind an `Arc`
#[derive(Debug)]
pub struct EphemeralCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> EphemeralCache<V> {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cache from the `cache` configuration section
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl)
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, or `None` if absent or expired
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            tracing::debug!(key, "cache entry expired");
            return None;
        }
        Some(entry.payload.clone())
    }

    /// Store `payload` under `key`, replacing any previous entry
    pub async fn put(&self, key: impl Into<String>, payload: V) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            stored_at: Instant::now(),
        };
        self.entries.write().await.insert(key, entry);
    }

    /// Remove the entry for `key`; returns whether one existed
    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Physically drop expired entries; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Number of stored entries, expired or not
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5 * 60);

    #[tokio::test(start_paused = true)]
    async fn from_config_uses_configured_ttl() {
        let config = CacheConfig {
            ttl: Duration::from_secs(30),
        };
        let cache = EphemeralCache::from_config(&config);
        cache.put("jobs", 1).await;

        assert_eq!(cache.ttl(), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("jobs").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_get_returns_value() {
        let cache = EphemeralCache::new(TTL);

        cache.put("jobs", vec!["rust engineer"]).await;

        assert_eq!(cache.get("jobs").await, Some(vec!["rust engineer"]));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_just_before_ttl_and_absent_just_after() {
        let cache = EphemeralCache::new(TTL);
        cache.put("jobs", vec![1, 2, 3]).await;

        tokio::time::advance(Duration::from_secs(4 * 60 + 59)).await;
        assert_eq!(cache.get("jobs").await, Some(vec![1, 2, 3]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("jobs").await, None);
        assert_eq!(cache.len().await, 1, "expiry does not evict");
    }

    #[tokio::test(start_paused = true)]
    async fn entry_at_exactly_ttl_is_absent() {
        let cache = EphemeralCache::new(TTL);
        cache.put("jobs", 1).await;

        tokio::time::advance(TTL).await;

        assert_eq!(cache.get("jobs").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn put_overwrites_and_refreshes_timestamp() {
        let cache = EphemeralCache::new(TTL);
        cache.put("jobs", "old").await;
        tokio::time::advance(Duration::from_secs(4 * 60)).await;

        cache.put("jobs", "new").await;
        tokio::time::advance(Duration::from_secs(2 * 60)).await;

        assert_eq!(cache.get("jobs").await, Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_purge_remove_entries() {
        let cache = EphemeralCache::new(TTL);
        cache.put("a", 1).await;
        cache.put("b", 2).await;

        assert!(cache.invalidate("a").await);
        assert!(!cache.invalidate("a").await);

        tokio::time::advance(TTL).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }
}
