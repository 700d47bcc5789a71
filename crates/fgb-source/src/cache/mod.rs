//! Caches for FlatGeobuf byte ranges.

mod range_cache;

pub use range_cache::{RangeCache, RangeKey};
