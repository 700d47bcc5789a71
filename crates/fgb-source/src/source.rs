//! Streaming FlatGeobuf reader over the range cache.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::cache::RangeCache;
use crate::config::SourceCacheConfig;
use crate::error::{Result, SourceError};
use crate::format::rtree::{self, FeatureRef, PackedRTree};
use crate::format::{ColumnMeta, Feature, HeaderMeta, SIZE_PREFIX_LEN};
use crate::types::{ByteRange, Envelope};

/// Options used when opening a source.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub page_size: u64,
    pub initial_header_request_length: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::from(&SourceCacheConfig::default())
    }
}

impl From<&SourceCacheConfig> for OpenOptions {
    fn from(config: &SourceCacheConfig) -> Self {
        Self {
            page_size: config.page_size,
            initial_header_request_length: config.initial_header_request_length,
        }
    }
}

/// Features to read from one page.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page_index: usize,
    /// Absolute byte range of the page in the file.
    pub range: ByteRange,
    /// Features in the page, sorted by offset.
    pub features: Vec<FeatureRef>,
}

/// Page requests needed to answer a query.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub pages: Vec<PageRequest>,
}

/// Size of a query before any feature bytes are fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEstimate {
    pub features: usize,
    /// Bytes of feature data that match the query.
    pub feature_bytes: u64,
    /// Bytes the page requests will transfer.
    pub requested_bytes: u64,
    pub requests: usize,
}

impl QueryPlan {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.pages.iter().map(|p| p.features.len()).sum()
    }

    /// Estimate the transfer size of this plan.
    ///
    /// Open-ended pages are estimated from the last feature's offset plus its
    /// length, or the mean known feature length when the last length is
    /// unknown.
    pub fn estimate(&self, feature_data_offset: u64) -> QueryEstimate {
        let mut estimate = QueryEstimate {
            features: self.feature_count(),
            requests: self.pages.len(),
            ..Default::default()
        };

        let known: Vec<u64> = self
            .pages
            .iter()
            .flat_map(|p| p.features.iter().filter_map(|f| f.length))
            .collect();
        let mean = if known.is_empty() {
            0
        } else {
            known.iter().sum::<u64>() / known.len() as u64
        };

        for page in &self.pages {
            estimate.feature_bytes += page
                .features
                .iter()
                .map(|f| f.length.unwrap_or(mean))
                .sum::<u64>();

            estimate.requested_bytes += match page.range.len() {
                Some(len) => len,
                None => page
                    .features
                    .last()
                    .map(|last| {
                        let end = feature_data_offset + last.offset + last.length.unwrap_or(mean);
                        end.saturating_sub(page.range.start)
                    })
                    .unwrap_or(0),
            };
        }

        estimate
    }
}

/// An opened FlatGeobuf file.
///
/// Holds the parsed header and the packed R-tree in memory. Feature data is
/// fetched on demand, one page at a time, through the shared [`RangeCache`].
pub struct FlatGeobufSource {
    url: String,
    cache: Arc<RangeCache>,
    header: HeaderMeta,
    index: Option<PackedRTree>,
    feature_data_offset: u64,
    /// Absolute file offsets where each page starts.
    pages: Vec<u64>,
    /// Absolute file offset where feature data ends, when known.
    data_end: Option<u64>,
}

impl std::fmt::Debug for FlatGeobufSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatGeobufSource")
            .field("url", &self.url)
            .field("features_count", &self.header.features_count)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl FlatGeobufSource {
    /// Open a source, fetching its header and spatial index.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn open(url: &str, cache: Arc<RangeCache>, options: OpenOptions) -> Result<Self> {
        let initial_len = options.initial_header_request_length.max(12);
        let mut data = cache.get(url, ByteRange::new(0, initial_len - 1)).await?;

        if let Some(needed) = HeaderMeta::required_len(&data) {
            if needed > data.len() as u64 && data.len() as u64 >= initial_len {
                debug!(needed = needed, "Header larger than initial request, refetching");
                data = cache.get(url, ByteRange::new(0, needed - 1)).await?;
            }
        }
        let header = HeaderMeta::parse(url, &data)?;

        let index_offset = header.index_offset();
        let features_count = header.features_count;

        if features_count > 0 && header.index_node_size == 0 {
            return Err(SourceError::format(
                url,
                "FlatGeobuf file does not contain a spatial index",
            ));
        }

        let index_size = rtree::index_size(features_count, header.index_node_size);
        let index_end = index_offset + index_size;
        if (data.len() as u64) < index_end {
            debug!(
                index_end = index_end,
                fetched = data.len(),
                "Index larger than initial request, refetching"
            );
            data = cache.get(url, ByteRange::new(0, index_end - 1)).await?;
            if (data.len() as u64) < index_end {
                return Err(SourceError::format(url, "truncated spatial index"));
            }
        }

        let feature_data_offset = index_end;
        let mut index = if features_count > 0 {
            let index_bytes = data.slice(index_offset as usize..index_end as usize);
            Some(
                PackedRTree::from_bytes(index_bytes, features_count, header.index_node_size)
                    .ok_or_else(|| SourceError::format(url, "truncated spatial index"))?,
            )
        } else {
            None
        };
        if let Some(index) = &index {
            index.check_offsets().map_err(|leaf| {
                SourceError::format(url, format!("feature offsets not monotonic at feature {}", leaf))
            })?;
        }

        let data_end = match &index {
            Some(index) => {
                let last_offset = index.leaf_offset(features_count as usize - 1);
                last_feature_end(&cache, url, feature_data_offset, last_offset).await
            }
            None => Some(feature_data_offset),
        };
        if let (Some(index), Some(end)) = (index.as_mut(), data_end) {
            index.set_data_end(end - feature_data_offset);
        }

        let pages = match &index {
            Some(index) => build_pages(&index.feature_offsets(), feature_data_offset, options.page_size),
            None => Vec::new(),
        };

        info!(
            url = %url,
            features = features_count,
            geometry_type = header.geometry_type_name(),
            index_bytes = index_size,
            pages = pages.len(),
            "Opened FlatGeobuf source"
        );

        Ok(Self {
            url: url.to_string(),
            cache,
            header,
            index,
            feature_data_offset,
            pages,
            data_end,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn header(&self) -> &HeaderMeta {
        &self.header
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.header.columns
    }

    /// Geometry type name of the source ("Polygon", "MultiPolygon", ...).
    pub fn geometry_type(&self) -> &'static str {
        self.header.geometry_type_name()
    }

    pub fn feature_count(&self) -> u64 {
        self.header.features_count
    }

    /// Offset from the start of the file to the first feature byte.
    pub fn feature_data_offset(&self) -> u64 {
        self.feature_data_offset
    }

    /// Number of pages feature data is split into.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size of the in-memory index, approximating this source's footprint.
    pub fn index_size_bytes(&self) -> u64 {
        self.index.as_ref().map(|i| i.byte_len() as u64).unwrap_or(0)
    }

    /// Bounds of the source, from the spatial index.
    pub fn bounds(&self) -> Envelope {
        match &self.index {
            Some(index) => index.bounds(),
            None => self.header.envelope.unwrap_or_else(Envelope::empty),
        }
    }

    /// Find features intersecting any of `envelopes` and group them into
    /// page requests. Features matching several envelopes appear once.
    pub fn search(&self, envelopes: &[Envelope]) -> QueryPlan {
        let index = match &self.index {
            Some(index) => index,
            None => return QueryPlan::default(),
        };

        let mut seen = HashSet::new();
        let mut refs: Vec<FeatureRef> = Vec::new();
        for envelope in envelopes {
            for found in index.search(envelope) {
                if seen.insert(found.index) {
                    refs.push(found);
                }
            }
        }
        refs.sort_by_key(|r| r.offset);

        let mut plan = QueryPlan::default();
        for feature in refs {
            let file_offset = self.feature_data_offset + feature.offset;
            let page_index = self
                .pages
                .partition_point(|&start| start <= file_offset)
                .saturating_sub(1);

            match plan.pages.last_mut() {
                Some(page) if page.page_index == page_index => page.features.push(feature),
                _ => plan.pages.push(PageRequest {
                    page_index,
                    range: self.page_range(page_index),
                    features: vec![feature],
                }),
            }
        }

        plan
    }

    /// Estimate feature count and transfer size for a query.
    pub fn estimate(&self, envelopes: &[Envelope]) -> QueryEstimate {
        self.search(envelopes).estimate(self.feature_data_offset)
    }

    fn page_range(&self, page_index: usize) -> ByteRange {
        let start = self.pages[page_index];
        match self.pages.get(page_index + 1) {
            Some(next) => ByteRange::new(start, next - 1),
            None => match self.data_end {
                Some(end) if end > start => ByteRange::new(start, end - 1),
                _ => ByteRange::from_offset(start),
            },
        }
    }

    /// Stream features intersecting any of `envelopes`.
    pub fn query(self: &Arc<Self>, envelopes: &[Envelope]) -> BoxStream<'static, Result<Feature>> {
        let plan = self.search(envelopes);
        self.features(plan)
    }

    /// Stream the features of a plan.
    ///
    /// Pages are fetched one at a time as the stream is polled, so at most
    /// one page of feature bytes is held by the stream. The stream is finite
    /// and can be recreated from the same plan.
    pub fn features(self: &Arc<Self>, plan: QueryPlan) -> BoxStream<'static, Result<Feature>> {
        let state = StreamState {
            source: Arc::clone(self),
            pages: plan.pages.into_iter(),
            current: None,
        };
        stream::try_unfold(state, next_feature).boxed()
    }

    /// Fetch every page a query needs into the range cache without decoding.
    ///
    /// Returns the number of pages fetched.
    pub async fn prefetch(&self, envelopes: &[Envelope]) -> Result<usize> {
        let plan = self.search(envelopes);
        for page in &plan.pages {
            self.cache.get(&self.url, page.range).await?;
        }
        Ok(plan.pages.len())
    }

    fn decode(&self, page_data: &Bytes, page_start: u64, feature: &FeatureRef) -> Result<Feature> {
        let pos = (self.feature_data_offset + feature.offset)
            .checked_sub(page_start)
            .ok_or_else(|| SourceError::format(&self.url, "feature precedes page start"))?
            as usize;

        if pos + SIZE_PREFIX_LEN > page_data.len() {
            return Err(SourceError::format(
                &self.url,
                format!("truncated page: feature at {} beyond {} bytes", feature.offset, page_data.len()),
            ));
        }

        let mut prefix = [0u8; SIZE_PREFIX_LEN];
        prefix.copy_from_slice(&page_data[pos..pos + SIZE_PREFIX_LEN]);
        let size = u32::from_le_bytes(prefix) as u64;

        let length = match feature.length {
            Some(length) => {
                if size + SIZE_PREFIX_LEN as u64 != length {
                    return Err(SourceError::format(
                        &self.url,
                        format!(
                            "feature data size mismatch: expected {}, size prefix was {}",
                            length, size
                        ),
                    ));
                }
                length
            }
            None => size + SIZE_PREFIX_LEN as u64,
        } as usize;

        if pos + length > page_data.len() {
            return Err(SourceError::format(
                &self.url,
                format!("truncated feature at offset {}", feature.offset),
            ));
        }

        Feature::parse(
            &self.url,
            &page_data[pos..pos + length],
            &self.header,
            feature.offset,
            feature.envelope,
        )
    }
}

struct StreamState {
    source: Arc<FlatGeobufSource>,
    pages: std::vec::IntoIter<PageRequest>,
    current: Option<(Bytes, u64, std::vec::IntoIter<FeatureRef>)>,
}

async fn next_feature(mut state: StreamState) -> Result<Option<(Feature, StreamState)>> {
    loop {
        if let Some((data, page_start, refs)) = state.current.as_mut() {
            if let Some(feature) = refs.next() {
                let decoded = state.source.decode(data, *page_start, &feature)?;
                return Ok(Some((decoded, state)));
            }
            state.current = None;
        }

        match state.pages.next() {
            Some(page) => {
                debug!(
                    url = %state.source.url,
                    page = page.page_index,
                    range = %page.range,
                    features = page.features.len(),
                    "Fetching feature page"
                );
                let data = state.source.cache.get(&state.source.url, page.range).await?;
                state.current = Some((data, page.range.start, page.features.into_iter()));
            }
            None => return Ok(None),
        }
    }
}

/// Absolute end of feature data, from the last feature's size prefix.
async fn last_feature_end(
    cache: &RangeCache,
    url: &str,
    feature_data_offset: u64,
    last_offset: u64,
) -> Option<u64> {
    let start = feature_data_offset.checked_add(last_offset)?;
    let range = ByteRange::new(start, start + SIZE_PREFIX_LEN as u64 - 1);
    match cache.get(url, range).await {
        Ok(bytes) if bytes.len() == SIZE_PREFIX_LEN => {
            let prefix: [u8; 4] = bytes[..].try_into().ok()?;
            Some(start + SIZE_PREFIX_LEN as u64 + u32::from_le_bytes(prefix) as u64)
        }
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Could not determine file length, last page is open-ended");
            None
        }
    }
}

/// Split feature data into pages that start on feature boundaries.
///
/// A new page starts at the first feature beginning more than `page_size`
/// bytes after the current page start. Offsets must be ascending, which
/// [`PackedRTree::check_offsets`] verifies when a source is opened.
pub(crate) fn build_pages(offsets: &[u64], feature_data_offset: u64, page_size: u64) -> Vec<u64> {
    let mut pages = vec![feature_data_offset];
    for offset in offsets {
        let file_offset = feature_data_offset + offset;
        let current = pages[pages.len() - 1];
        if file_offset > current && file_offset - current > page_size {
            pages.push(file_offset);
        }
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pages() {
        let offsets: Vec<u64> = (0..10).map(|i| i * 100).collect();
        assert_eq!(build_pages(&offsets, 1000, 250), vec![1000, 1300, 1600, 1900]);
        assert_eq!(build_pages(&offsets, 0, 10_000), vec![0]);
        assert_eq!(build_pages(&[], 50, 10), vec![50]);
    }

    #[test]
    fn test_plan_estimate() {
        let feature = |offset: u64, length: Option<u64>| FeatureRef {
            offset,
            length,
            index: offset as usize,
            envelope: Envelope::world(),
        };
        let plan = QueryPlan {
            pages: vec![
                PageRequest {
                    page_index: 0,
                    range: ByteRange::new(100, 399),
                    features: vec![feature(0, Some(100)), feature(100, Some(100))],
                },
                PageRequest {
                    page_index: 1,
                    range: ByteRange::from_offset(400),
                    features: vec![feature(300, None)],
                },
            ],
        };

        let estimate = plan.estimate(100);
        assert_eq!(estimate.features, 3);
        assert_eq!(estimate.requests, 2);
        assert_eq!(estimate.feature_bytes, 300);
        assert_eq!(estimate.requested_bytes, 300 + 100);
    }
}
