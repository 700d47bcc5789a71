//! Memory-bounded LRU cache of fetched byte ranges.
//!
//! ## Memory-Based Eviction
//!
//! Entries are weighted by their length in bytes. On insert, least recently
//! used entries are popped until the new entry fits. An entry larger than
//! the whole budget is handed back to the caller without being stored.
//!
//! ## In-flight de-duplication
//!
//! Concurrent requests for the same `(url, range)` share one fetch. The
//! first caller starts it; later callers await the same shared future.
//! Failures are delivered to every waiter and never cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::FetchError;
use crate::fetch::RangeFetcher;
use crate::types::{ByteRange, CacheStats};

/// Cache key: the URL and the exact requested range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub url: String,
    pub range: ByteRange,
}

impl RangeKey {
    pub fn new(url: impl Into<String>, range: ByteRange) -> Self {
        Self {
            url: url.into(),
            range,
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, FetchError>>>;

struct CacheState {
    entries: LruCache<RangeKey, Bytes>,
    current_memory: u64,
    pending: HashMap<RangeKey, (u64, SharedFetch)>,
    next_fetch_id: u64,
}

/// Byte-range cache in front of a [`RangeFetcher`].
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RangeCache {
    fetcher: Arc<dyn RangeFetcher>,
    state: Mutex<CacheState>,
    memory_limit: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RangeCache {
    /// Create a cache holding at most `memory_limit` bytes.
    pub fn new(fetcher: Arc<dyn RangeFetcher>, memory_limit: u64) -> Self {
        Self {
            fetcher,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                current_memory: 0,
                pending: HashMap::new(),
                next_fetch_id: 0,
            }),
            memory_limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get `range` of `url`, fetching it on a miss.
    pub async fn get(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchError> {
        let key = RangeKey::new(url, range);

        let (fetch_id, fetch) = {
            let mut state = self.state.lock().await;

            if let Some(bytes) = state.entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("fgb_range_cache_hits_total").increment(1);
                trace!(url = %url, range = %range, "Range cache hit");
                return Ok(bytes.clone());
            }

            if let Some((id, pending)) = state.pending.get(&key) {
                // Joining a fetch already in flight does not issue a request
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("fgb_range_cache_hits_total").increment(1);
                (*id, pending.clone())
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("fgb_range_cache_misses_total").increment(1);
                debug!(url = %url, range = %range, "Range cache miss");

                let id = state.next_fetch_id;
                state.next_fetch_id += 1;
                let fetch = Self::start_fetch(self.fetcher.clone(), key.clone());
                state.pending.insert(key.clone(), (id, fetch.clone()));
                (id, fetch)
            }
        };

        let result = fetch.await;

        let mut state = self.state.lock().await;
        let owns_pending = matches!(state.pending.get(&key), Some((id, _)) if *id == fetch_id);
        if owns_pending {
            state.pending.remove(&key);
            if let Ok(bytes) = &result {
                self.insert_locked(&mut state, key, bytes.clone());
            }
        }

        result
    }

    fn start_fetch(fetcher: Arc<dyn RangeFetcher>, key: RangeKey) -> SharedFetch {
        async move {
            fetcher
                .fetch_range(&key.url, key.range)
                .await
                .map_err(|source| FetchError::new(key.url.clone(), key.range, source))
        }
        .boxed()
        .shared()
    }

    fn insert_locked(&self, state: &mut CacheState, key: RangeKey, bytes: Bytes) {
        let size = bytes.len() as u64;
        if size > self.memory_limit {
            debug!(
                url = %key.url,
                size = size,
                limit = self.memory_limit,
                "Range larger than cache budget, not caching"
            );
            return;
        }

        while state.current_memory + size > self.memory_limit {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.current_memory = state.current_memory.saturating_sub(evicted.len() as u64);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    counter!("fgb_range_cache_evictions_total").increment(1);
                }
                None => break,
            }
        }

        if let Some(replaced) = state.entries.put(key, bytes) {
            state.current_memory = state.current_memory.saturating_sub(replaced.len() as u64);
        }
        state.current_memory += size;
    }

    /// Check whether a range is resident without touching LRU order.
    pub async fn contains(&self, url: &str, range: ByteRange) -> bool {
        let state = self.state.lock().await;
        state.entries.contains(&RangeKey::new(url, range))
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.entries.len(),
            memory_bytes: state.current_memory,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clear all resident entries. In-flight fetches are unaffected.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.current_memory = 0;
    }

    /// Current resident size in bytes.
    pub async fn memory_usage(&self) -> u64 {
        self.state.lock().await.current_memory
    }

    /// Memory budget in bytes.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}
