//! Shared cache of opened sources.

use std::sync::Arc;

use futures::stream::BoxStream;
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::cache::RangeCache;
use crate::config::SourceCacheConfig;
use crate::error::{Result, SourceError};
use crate::fetch::RangeFetcher;
use crate::format::Feature;
use crate::source::{FlatGeobufSource, OpenOptions};
use crate::types::{CacheStats, Envelope};

type SourceCell = Arc<OnceCell<Arc<FlatGeobufSource>>>;

/// Opens each source once and shares it between callers.
///
/// All sources read through one [`RangeCache`]. Sources are kept in LRU
/// order and evicted when their combined index size exceeds
/// `max_index_size`. The most recently used source is never evicted.
pub struct SourceCache {
    config: SourceCacheConfig,
    range_cache: Arc<RangeCache>,
    sources: Mutex<LruCache<String, SourceCell>>,
}

impl SourceCache {
    /// Create a source cache reading through `fetcher`.
    pub fn new(config: SourceCacheConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Self> {
        config.validate().map_err(SourceError::Config)?;

        info!(
            max_index_size = config.max_index_size,
            range_cache_size = config.range_cache_size,
            page_size = config.page_size,
            "Creating source cache"
        );

        let range_cache = Arc::new(RangeCache::new(fetcher, config.range_cache_size));
        Ok(Self {
            config,
            range_cache,
            sources: Mutex::new(LruCache::unbounded()),
        })
    }

    pub fn config(&self) -> &SourceCacheConfig {
        &self.config
    }

    /// The byte-range cache shared by every source.
    pub fn range_cache(&self) -> &Arc<RangeCache> {
        &self.range_cache
    }

    /// Get the source for `url`, opening it on first use.
    ///
    /// Concurrent calls for the same URL share one open. A failed open is not
    /// remembered, so the next call retries.
    pub async fn get(&self, url: &str) -> Result<Arc<FlatGeobufSource>> {
        let cell = {
            let mut sources = self.sources.lock().await;
            match sources.get(url) {
                Some(cell) => cell.clone(),
                None => {
                    let cell: SourceCell = Arc::new(OnceCell::new());
                    sources.put(url.to_string(), cell.clone());
                    cell
                }
            }
        };

        let opened = cell
            .get_or_try_init(|| async {
                let options = OpenOptions::from(&self.config);
                FlatGeobufSource::open(url, self.range_cache.clone(), options)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned();

        let mut sources = self.sources.lock().await;
        match opened {
            Ok(source) => {
                self.evict_over_budget(&mut sources);
                Ok(source)
            }
            Err(e) => {
                let same_cell = sources
                    .peek(url)
                    .map(|current| Arc::ptr_eq(current, &cell))
                    .unwrap_or(false);
                if same_cell {
                    sources.pop(url);
                }
                Err(e)
            }
        }
    }

    fn evict_over_budget(&self, sources: &mut LruCache<String, SourceCell>) {
        let index_bytes = |sources: &LruCache<String, SourceCell>| -> u64 {
            sources
                .iter()
                .filter_map(|(_, cell)| cell.get())
                .map(|source| source.index_size_bytes())
                .sum()
        };

        let mut total = index_bytes(sources);
        while total > self.config.max_index_size && sources.len() > 1 {
            match sources.pop_lru() {
                Some((url, cell)) => {
                    let freed = cell.get().map(|s| s.index_size_bytes()).unwrap_or(0);
                    total = total.saturating_sub(freed);
                    debug!(url = %url, freed = freed, "Evicted source index");
                }
                None => break,
            }
        }
    }

    /// Stream features of `url` intersecting `envelopes`.
    pub async fn query(
        &self,
        url: &str,
        envelopes: &[Envelope],
    ) -> Result<BoxStream<'static, Result<Feature>>> {
        let source = self.get(url).await?;
        Ok(source.query(envelopes))
    }

    /// Number of sources currently held.
    pub async fn len(&self) -> usize {
        self.sources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sources.lock().await.is_empty()
    }

    /// Combined size of every held index.
    pub async fn index_bytes(&self) -> u64 {
        let sources = self.sources.lock().await;
        sources
            .iter()
            .filter_map(|(_, cell)| cell.get())
            .map(|source| source.index_size_bytes())
            .sum()
    }

    /// Statistics of the shared range cache.
    pub async fn range_cache_stats(&self) -> CacheStats {
        self.range_cache.stats().await
    }
}
