//! Range-cached FlatGeobuf feature sources.
//!
//! This crate reads indexed FlatGeobuf files over byte-range requests. Only
//! the header, the packed R-tree and the feature pages touched by a query are
//! ever fetched, and every fetched range goes through one shared LRU cache.
//!
//! # Architecture
//!
//! ```text
//! SourceCache::get(url)
//!      │
//!      ├─► Known url: return the shared FlatGeobufSource
//!      │
//!      └─► First use: FlatGeobufSource::open
//!               ├─► header + index bytes via RangeCache
//!               └─► split feature data into fixed pages
//!
//! FlatGeobufSource::query(envelopes)
//!      │
//!      ├─► Packed R-tree search (in memory)
//!      │
//!      ├─► Group hits by page → QueryPlan
//!      │
//!      └─► Stream features page by page
//!               │
//!               └─► RangeCache::get(url, page range)
//!                        ├─► Cache hit: resident bytes
//!                        └─► Cache miss: RangeFetcher (HTTP, file, memory)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fgb_source::{Envelope, HttpRangeFetcher, SourceCache, SourceCacheConfig};
//! use futures::TryStreamExt;
//!
//! let fetcher = Arc::new(HttpRangeFetcher::from_env()?);
//! let cache = SourceCache::new(SourceCacheConfig::from_env(), fetcher)?;
//!
//! let source = cache.get("https://example.com/eez.fgb").await?;
//! let mut features = source.query(&[Envelope::new(-120.0, 30.0, -110.0, 40.0)]);
//! while let Some(feature) = features.try_next().await? {
//!     println!("{} {:?}", feature.id, feature.property("MRGID_EEZ"));
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod source;
pub mod source_cache;
pub mod types;
pub mod writer;

// Re-export commonly used types at crate root
pub use cache::{RangeCache, RangeKey};
pub use config::{HttpFetcherConfig, SourceCacheConfig};
pub use error::{BoxError, FetchError, Result, SourceError};
pub use fetch::{FileRangeFetcher, HttpRangeFetcher, InMemoryRangeFetcher, RangeFetcher};
pub use format::{ColumnMeta, Feature, FeatureRef, HeaderMeta, Value};
pub use source::{FlatGeobufSource, OpenOptions, PageRequest, QueryEstimate, QueryPlan};
pub use source_cache::SourceCache;
pub use types::{parse_byte_size, ByteRange, CacheStats, Envelope};
pub use writer::{ColumnKind, ColumnSpec, FgbWriter};

/// FlatGeobuf geometry and column type codes.
pub use flatgeobuf::{ColumnType, GeometryType};
