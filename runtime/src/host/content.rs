//! Embed content fetch cache.
//!
//! Short-lived, session-local cache of embed HTML keyed by embed id.
//!
//! ## Eviction
//!
//! Entries expire `ttl` after they were fetched. When the cache is full the
//! oldest insertion is evicted, regardless of how recently it was read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use upm_embed::{embed_content_path, Clock};
use url::Url;

use crate::error::ContentError;
use crate::net::{resolve_url, FetchRequest, Network};

/// Default time-to-live of a cached fragment.
pub const DEFAULT_CONTENT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of cached fragments.
pub const DEFAULT_CONTENT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct ContentEntry {
    html: String,
    fetched_at_ms: u64,
}

impl ContentEntry {
    fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at_ms)
    }
}

/// Insertion-ordered HTML cache.
pub struct ContentCache {
    entries: Mutex<IndexMap<String, ContentEntry>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl ContentCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        tracing::debug!(
            "ContentCache initialized: ttl {}s, capacity {capacity}",
            ttl.as_secs()
        );
        Self {
            entries: Mutex::new(IndexMap::new()),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(DEFAULT_CONTENT_TTL, DEFAULT_CONTENT_CAPACITY, clock)
    }

    /// Fresh HTML for `embed_id`, if any.
    pub fn get(&self, embed_id: &str) -> Option<String> {
        let now = self.clock.now_ms();
        let ttl_ms = self.ttl.as_millis() as u64;
        let entries = self.entries.lock().ok()?;
        entries
            .get(embed_id)
            .filter(|e| e.age_ms(now) < ttl_ms)
            .map(|e| e.html.clone())
    }

    /// Store `html`, evicting the oldest insertion when full.
    pub fn insert(&self, embed_id: &str, html: String) {
        let fetched_at_ms = self.clock.now_ms();
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        // a refreshed entry moves to the back of the insertion order
        entries.shift_remove(embed_id);
        while entries.len() >= self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                tracing::debug!("content cache full, evicted {evicted}");
            }
        }
        entries.insert(
            embed_id.to_string(),
            ContentEntry {
                html,
                fetched_at_ms,
            },
        );
    }

    /// Drop entries at least `age` old. Returns how many were dropped.
    pub fn retain_younger_than(&self, age: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_ms = age.as_millis() as u64;
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.age_ms(now) < max_ms);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Fetches `/embed/{id}` through the content cache.
pub struct ContentFetcher {
    origin: Url,
    network: Arc<dyn Network>,
    cache: ContentCache,
}

impl ContentFetcher {
    pub fn new(origin: Url, network: Arc<dyn Network>, cache: ContentCache) -> Self {
        Self {
            origin,
            network,
            cache,
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Cached HTML when fresh, otherwise a network fetch.
    pub async fn get(&self, embed_id: &str) -> Result<String, ContentError> {
        if let Some(html) = self.cache.get(embed_id) {
            tracing::debug!("content cache hit for {embed_id}");
            return Ok(html);
        }

        let url = resolve_url(&self.origin, &embed_content_path(embed_id))?;
        let request = FetchRequest::get(url).with_header("accept", "text/html");
        let response = self.network.fetch(&request).await?;
        if !response.ok() {
            return Err(ContentError::Status(response.status));
        }

        let html = response.text_body();
        self.cache.insert(embed_id, html.clone());
        Ok(html)
    }
}
