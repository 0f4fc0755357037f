//! Process-wide TTL cache for inventory responses
//!
//! Readers see the cached body while it is fresh. An expired or missing
//! entry is refreshed by exactly one caller per key; concurrent callers for
//! the same key wait on that refresh instead of issuing their own request.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Clone)]
struct Cached {
    body: Value,
    fetched_at: Instant,
}

/// TTL cache keyed by request URL
pub struct TtlCache {
    ttl: Duration,
    entries: DashMap<String, Cached>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl TtlCache {
    /// Create a cache; a zero TTL disables caching
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            writers: DashMap::new(),
        }
    }

    /// Configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.body.clone())
    }

    /// Fresh cached body for `key`, or the result of `fetch` (cached on success)
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if self.ttl.is_zero() {
            return fetch().await;
        }
        if let Some(body) = self.fresh(key) {
            trace!(key, "inventory cache hit");
            return Ok(body);
        }

        let writer = self
            .writers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = writer.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(body) = self.fresh(key) {
            return Ok(body);
        }

        let body = fetch().await?;
        self.entries.insert(
            key.to_string(),
            Cached {
                body: body.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(body)
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every entry under a URL prefix (e.g. one provider)
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// Number of cached entries, fresh or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
