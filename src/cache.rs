#![forbid(unsafe_code)]

//! Time-bounded memo of metadata lookups keyed by normalized URL.
//!
//! Entries expire lazily: a read past the TTL refetches, and the sweeper
//! purges whatever nobody asked for again. Concurrent misses on the same key
//! share one extractor call.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::extractor::{MediaExtractor, VideoMetadata};

pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(600);

struct CacheEntry {
    metadata: Arc<VideoMetadata>,
    fetched_at: Instant,
}

pub struct MetadataCache {
    ttl: Duration,
    extractor: Arc<dyn MediaExtractor>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Canonical cache key for a user-supplied URL. Fragments never change what
/// the platform serves, so they are dropped.
pub fn normalize_url(raw: &str) -> FetchResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FetchError::Validation("URL is required".to_string()));
    }
    let mut url = Url::parse(trimmed)
        .map_err(|err| FetchError::Validation(format!("invalid URL '{trimmed}': {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::Validation(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    url.set_fragment(None);
    Ok(url.to_string())
}

/// A caller's claim on the per-key fetch gate. Released on drop, so a caller
/// whose future is cancelled mid-fetch still cleans up.
struct InFlightSlot<'a> {
    cache: &'a MetadataCache,
    key: &'a str,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InFlightSlot<'a> {
    fn claim(cache: &'a MetadataCache, key: &'a str) -> Self {
        let gate = Arc::clone(
            cache
                .in_flight
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        Self { cache, key, gate }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.cache.in_flight.lock();
        // Two references left means nobody else is queued on this key.
        if in_flight.get(self.key).is_some_and(|current| {
            Arc::ptr_eq(current, &self.gate) && Arc::strong_count(&self.gate) <= 2
        }) {
            in_flight.remove(self.key);
        }
    }
}

impl MetadataCache {
    pub fn new(extractor: Arc<dyn MediaExtractor>, ttl: Duration) -> Self {
        Self {
            ttl,
            extractor,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a fresh entry or fetches one. Failures are never cached.
    pub async fn get_or_fetch(&self, url: &str) -> FetchResult<Arc<VideoMetadata>> {
        let key = normalize_url(url)?;
        if let Some(hit) = self.fresh(&key) {
            debug!(url = %key, "metadata cache hit");
            return Ok(hit);
        }

        let slot = InFlightSlot::claim(self, &key);
        let _turn = slot.gate.lock().await;
        // Another caller may have filled the entry while we waited.
        match self.fresh(&key) {
            Some(hit) => Ok(hit),
            None => self.fetch_and_store(&key).await,
        }
    }

    fn fresh(&self, key: &str) -> Option<Arc<VideoMetadata>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                Some(Arc::clone(&entry.metadata))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn fetch_and_store(&self, key: &str) -> FetchResult<Arc<VideoMetadata>> {
        info!(url = %key, "fetching metadata");
        match self.extractor.fetch_metadata(key).await {
            Ok(metadata) => {
                let metadata = Arc::new(metadata);
                self.entries.lock().insert(
                    key.to_string(),
                    CacheEntry {
                        metadata: Arc::clone(&metadata),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(metadata)
            }
            Err(err) if err.is_bot_detection() => {
                warn!(url = %key, error = %err, "metadata fetch hit bot detection");
                Err(FetchError::BotDetection {
                    technical: err.message,
                })
            }
            Err(err) => {
                warn!(url = %key, error = %err, "metadata fetch failed");
                Err(FetchError::MetadataFetch(err.message))
            }
        }
    }

    /// Drops every entry older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
