//! In-memory range fetcher.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use super::{slice_to_range, RangeFetcher};
use crate::error::BoxError;
use crate::types::ByteRange;

/// Serves byte ranges from named in-memory blobs.
///
/// Counts every fetch and can be told to fail for specific URLs, which makes
/// it useful for exercising cache behaviour.
#[derive(Default)]
pub struct InMemoryRangeFetcher {
    blobs: RwLock<HashMap<String, Bytes>>,
    failing: RwLock<HashSet<String>>,
    fetches: AtomicU64,
    bytes_served: AtomicU64,
}

impl InMemoryRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the blob served for `url`.
    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(url.into(), data.into());
        }
    }

    /// Make every fetch of `url` fail until [`recover`](Self::recover) is called.
    pub fn fail_url(&self, url: impl Into<String>) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(url.into());
        }
    }

    /// Stop failing fetches of `url`.
    pub fn recover(&self, url: &str) {
        if let Ok(mut failing) = self.failing.write() {
            failing.remove(url);
        }
    }

    /// Number of fetches served or attempted so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Total bytes returned so far.
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RangeFetcher for InMemoryRangeFetcher {
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, BoxError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let failing = self
            .failing
            .read()
            .map(|failing| failing.contains(url))
            .unwrap_or(false);
        if failing {
            return Err(format!("simulated failure for {}", url).into());
        }

        let blob = self
            .blobs
            .read()
            .map_err(|_| BoxError::from("blob store lock poisoned"))?
            .get(url)
            .cloned()
            .ok_or_else(|| BoxError::from(format!("not found: {}", url)))?;

        let bytes = slice_to_range(blob, range);
        self.bytes_served
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }
}
