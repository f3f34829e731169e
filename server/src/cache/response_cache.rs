use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::server_config::cfg;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    created_at: DateTime<Utc>,
}

/// Keyed cache for generated text artifacts (drafts, quick replies). Reads
/// only serve entries inside the freshness window; entries past the hard
/// expiry are dropped by the scheduled sweep.
#[derive(Clone)]
pub struct ResponseCache<T: Clone> {
    inner: Arc<RwLock<HashMap<String, Entry<T>>>>,
    fresh_window: Duration,
    hard_expiry: Duration,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(fresh_window: Duration, hard_expiry: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            fresh_window,
            hard_expiry,
        }
    }

    pub fn from_config() -> Self {
        Self::new(
            Duration::hours(cfg.cache.response_fresh_hours),
            Duration::days(cfg.cache.response_expiry_days),
        )
    }

    pub async fn get_fresh(&self, key: &str) -> Option<T> {
        let map = self.inner.read().await;
        map.get(key)
            .filter(|entry| Utc::now() - entry.created_at <= self.fresh_window)
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: String, value: T) {
        self.insert_at(key, value, Utc::now()).await;
    }

    pub async fn insert_at(&self, key: String, value: T, created_at: DateTime<Utc>) {
        self.inner
            .write()
            .await
            .insert(key, Entry { value, created_at });
    }

    /// Drop entries past the hard expiry. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        let cutoff = Utc::now() - self.hard_expiry;
        map.retain(|_, entry| entry.created_at > cutoff);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Cache key scoping a generated artifact to its message and variant.
pub fn response_cache_key(message_id: &str, variant: &str) -> String {
    format!("{message_id}:{variant}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache<String> {
        ResponseCache::new(Duration::hours(24), Duration::days(7))
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served() {
        let cache = cache();
        cache.insert("m1:professional".to_string(), "draft".to_string()).await;
        assert_eq!(
            cache.get_fresh("m1:professional").await.as_deref(),
            Some("draft")
        );
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_served_but_kept() {
        let cache = cache();
        cache
            .insert_at(
                "m1".to_string(),
                "old draft".to_string(),
                Utc::now() - Duration::hours(25),
            )
            .await;

        assert!(cache.get_fresh("m1").await.is_none());
        // still resident until the sweep catches it
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_hard_expired() {
        let cache = cache();
        cache.insert("fresh".to_string(), "a".to_string()).await;
        cache
            .insert_at(
                "stale".to_string(),
                "b".to_string(),
                Utc::now() - Duration::hours(30),
            )
            .await;
        cache
            .insert_at(
                "expired".to_string(),
                "c".to_string(),
                Utc::now() - Duration::days(8),
            )
            .await;

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.len().await, 2);
        assert!(cache.get_fresh("fresh").await.is_some());
        assert!(cache.get_fresh("stale").await.is_none());
    }

    #[test]
    fn test_cache_key_scopes_by_variant() {
        assert_eq!(response_cache_key("m1", "formal"), "m1:formal");
        assert_ne!(
            response_cache_key("m1", "formal"),
            response_cache_key("m1", "friendly")
        );
    }
}
