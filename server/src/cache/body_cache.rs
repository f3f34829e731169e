use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tokio::sync::RwLock;

use crate::graph::types::AttachmentMeta;
use crate::server_config::cfg;

/// Fetched message content. Entries older than the cache TTL are treated as
/// absent. Bodies live in memory only and are never persisted.
#[derive(Debug, Clone)]
pub struct CachedBody {
    pub body: String,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub fetched_at: DateTime<Utc>,
}

impl CachedBody {
    pub fn new(body: String, html: Option<String>, attachments: Vec<AttachmentMeta>) -> Self {
        Self {
            body,
            html,
            attachments,
            fetched_at: Utc::now(),
        }
    }
}

pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

pub struct PrefetchOptions {
    pub max_concurrent: usize,
    pub pause: std::time::Duration,
    pub on_progress: Option<ProgressFn>,
}

impl PrefetchOptions {
    pub fn from_config() -> Self {
        Self {
            max_concurrent: cfg.analysis.batch_concurrency,
            pause: std::time::Duration::from_millis(cfg.cache.prefetch_pause_ms),
            on_progress: None,
        }
    }
}

/// Process-local TTL cache for message bodies, injected through server state.
/// Eviction is lazy: staleness is checked on read, there is no sweeper.
#[derive(Clone)]
pub struct BodyCache {
    inner: Arc<RwLock<HashMap<String, CachedBody>>>,
    ttl: Duration,
}

impl BodyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_config() -> Self {
        Self::new(Duration::seconds(cfg.cache.body_ttl_secs))
    }

    /// Returns the entry only while it is fresh; a stale entry is removed
    /// and reported absent.
    pub async fn get(&self, message_id: &str) -> Option<CachedBody> {
        let mut map = self.inner.write().await;
        match map.get(message_id) {
            Some(entry) if Utc::now() - entry.fetched_at <= self.ttl => Some(entry.clone()),
            Some(_) => {
                map.remove(message_id);
                None
            }
            None => None,
        }
    }

    /// Unconditionally overwrites any existing entry.
    pub async fn insert(&self, message_id: String, entry: CachedBody) {
        self.inner.write().await.insert(message_id, entry);
    }

    pub async fn contains_fresh(&self, message_id: &str) -> bool {
        let map = self.inner.read().await;
        map.get(message_id)
            .map(|entry| Utc::now() - entry.fetched_at <= self.ttl)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Warm the cache for `ids`. Already-fresh ids are skipped, the rest are
    /// fetched in groups of `max_concurrent` with a pause between groups.
    /// Failures are swallowed and still counted as completed so reported
    /// progress stays monotonic; the caller only observes a fuller or
    /// emptier cache afterward.
    pub async fn prefetch<F, Fut>(
        &self,
        message_ids: &[String],
        fetch_fn: F,
        opts: PrefetchOptions,
    ) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<CachedBody>>,
    {
        let mut pending = Vec::new();
        for id in message_ids {
            if !self.contains_fresh(id).await {
                pending.push(id.clone());
            }
        }

        let total = pending.len();
        let mut completed = 0usize;

        for (chunk_idx, chunk) in pending.chunks(opts.max_concurrent.max(1)).enumerate() {
            if chunk_idx > 0 {
                tokio::time::sleep(opts.pause).await;
            }

            let futures = chunk.iter().map(|id| {
                let fut = fetch_fn(id.clone());
                let id = id.clone();
                async move { (id, fut.await) }
            });

            for (id, result) in join_all(futures).await {
                completed += 1;
                match result {
                    Ok(entry) => self.insert(id, entry).await,
                    Err(e) => {
                        tracing::debug!("Prefetch failed for {}: {:?}", id, e);
                    }
                }
                if let Some(on_progress) = &opts.on_progress {
                    on_progress(completed, total);
                }
            }
        }

        completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn cache() -> BodyCache {
        BodyCache::new(Duration::minutes(15))
    }

    fn entry(body: &str) -> CachedBody {
        CachedBody::new(body.to_string(), None, Vec::new())
    }

    #[tokio::test]
    async fn test_set_then_get_returns_stored_values() {
        let cache = cache();
        cache
            .insert(
                "m1".to_string(),
                CachedBody::new("plain".to_string(), Some("<p>plain</p>".to_string()), Vec::new()),
            )
            .await;

        let got = cache.get("m1").await.unwrap();
        assert_eq!(got.body, "plain");
        assert_eq!(got.html.as_deref(), Some("<p>plain</p>"));
        assert!(got.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let cache = cache();
        let mut stale = entry("old");
        stale.fetched_at = Utc::now() - Duration::minutes(16);
        cache.insert("m1".to_string(), stale).await;

        assert!(cache.get("m1").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache = cache();
        cache.insert("m1".to_string(), entry("first")).await;
        cache.insert("m1".to_string(), entry("second")).await;
        assert_eq!(cache.get("m1").await.unwrap().body, "second");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_prefetch_skips_cached_ids() {
        let cache = cache();
        cache.insert("m1".to_string(), entry("cached")).await;

        let fetches = AtomicUsize::new(0);
        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let completed = cache
            .prefetch(
                &ids,
                |id| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(entry(&format!("body-{id}"))) }
                },
                PrefetchOptions {
                    max_concurrent: 2,
                    pause: std::time::Duration::from_millis(0),
                    on_progress: None,
                },
            )
            .await;

        assert_eq!(completed, 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 3);
        // the cached entry was not overwritten
        assert_eq!(cache.get("m1").await.unwrap().body, "cached");
    }

    #[tokio::test]
    async fn test_prefetch_swallows_failures_and_stays_monotonic() {
        let cache = cache();
        let ids: Vec<String> = (0..5).map(|i| format!("m{i}")).collect();

        let progress: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();

        let completed = cache
            .prefetch(
                &ids,
                |id| async move {
                    if id == "m2" {
                        anyhow::bail!("boom")
                    }
                    Ok(entry("ok"))
                },
                PrefetchOptions {
                    max_concurrent: 2,
                    pause: std::time::Duration::from_millis(0),
                    on_progress: Some(Box::new(move |done, total| {
                        progress_clone.lock().unwrap().push((done, total));
                    })),
                },
            )
            .await;

        // failures count as completed
        assert_eq!(completed, 5);
        assert_eq!(cache.len().await, 4);
        assert!(cache.get("m2").await.is_none());

        let calls = progress.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(calls.last().unwrap(), &(5, 5));
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let cache = cache();
        cache.insert("m1".to_string(), entry("x")).await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }
}
