//! Byte-range fetchers.
//!
//! A [`RangeFetcher`] retrieves one byte range of one URL. It knows nothing
//! about caching; the [`RangeCache`](crate::RangeCache) sits in front of it.

mod file;
mod http;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BoxError;
use crate::types::ByteRange;

pub use file::FileRangeFetcher;
pub use http::HttpRangeFetcher;
pub use memory::InMemoryRangeFetcher;

/// Retrieve byte ranges from a remote or local resource.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch `range` of `url`.
    ///
    /// Implementations may return fewer bytes than requested when the range
    /// extends past the end of the resource.
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, BoxError>;
}

/// Slice a full-resource body down to the requested range.
pub(crate) fn slice_to_range(body: Bytes, range: ByteRange) -> Bytes {
    let len = body.len() as u64;
    let start = range.start.min(len);
    let end = match range.end {
        Some(end) => end.saturating_add(1).min(len),
        None => len,
    };
    if start >= end {
        return Bytes::new();
    }
    body.slice(start as usize..end as usize)
}
