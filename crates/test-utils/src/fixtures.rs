//! Common test fixtures for overlay tests.
//!
//! Fixtures are built with [`FgbWriter`] so every file is a valid indexed
//! FlatGeobuf, and served either from an [`InMemoryRangeFetcher`] or from a
//! temp directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use fgb_source::{
    ColumnKind, ColumnSpec, FgbWriter, GeometryType, InMemoryRangeFetcher, SourceCache,
    SourceCacheConfig, Value,
};
use geo_types::Geometry;

/// Side of a square, in degrees at the equator, whose spherical area is 1 km².
pub const KM_SQUARE_DEGREES: f64 = 0.0089831528;

/// Well-known in-memory source URLs.
pub mod sources {
    /// Base habitat polygons.
    pub const HABITATS: &str = "mem://habitats.fgb";

    /// Exclusive economic zones, keyed by `MRGID_EEZ`.
    pub const EEZ: &str = "mem://eez.fgb";

    /// Land polygons.
    pub const LAND: &str = "mem://land.fgb";

    /// Base line features.
    pub const CABLES: &str = "mem://cables.fgb";
}

/// Builds one FlatGeobuf fixture.
pub struct LayerFixture {
    writer: FgbWriter,
}

impl LayerFixture {
    pub fn new(name: &str, geometry_type: GeometryType, columns: &[(&str, ColumnKind)]) -> Self {
        let columns = columns
            .iter()
            .map(|(name, kind)| ColumnSpec::new(*name, *kind))
            .collect();
        Self {
            writer: FgbWriter::new(name, geometry_type, columns),
        }
    }

    /// Polygon layer with a single string column.
    pub fn polygons(name: &str, column: &str) -> Self {
        Self::new(name, GeometryType::Polygon, &[(column, ColumnKind::String)])
    }

    pub fn feature(mut self, geometry: impl Into<Geometry<f64>>, properties: &[(&str, Value)]) -> Self {
        self.writer.add_feature(geometry.into(), props(properties));
        self
    }

    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    /// Serialized FlatGeobuf bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.writer
            .to_bytes()
            .unwrap_or_else(|e| panic!("failed to serialize fixture: {}", e))
    }

    /// Write the fixture into `dir` as `file_name` and return its path.
    pub fn write_to(&self, dir: &tempfile::TempDir, file_name: &str) -> PathBuf {
        let path = dir.path().join(file_name);
        self.writer
            .write_to(&path)
            .unwrap_or_else(|e| panic!("failed to write fixture {}: {}", path.display(), e));
        path
    }
}

/// Property map from `(key, value)` pairs.
pub fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Small cache limits so tests exercise page splitting and eviction.
pub fn test_cache_config() -> SourceCacheConfig {
    SourceCacheConfig {
        max_index_size: 1024 * 1024,
        range_cache_size: 4 * 1024 * 1024,
        page_size: 16 * 1024,
        initial_header_request_length: 8 * 1024,
    }
}

/// A source cache over an in-memory fetcher serving `fixtures`.
pub fn memory_cache(fixtures: &[(&str, &LayerFixture)]) -> (Arc<InMemoryRangeFetcher>, SourceCache) {
    let fetcher = Arc::new(InMemoryRangeFetcher::new());
    for (url, fixture) in fixtures {
        fetcher.insert(*url, fixture.to_bytes());
    }
    let cache = SourceCache::new(test_cache_config(), fetcher.clone())
        .unwrap_or_else(|e| panic!("invalid test cache config: {}", e));
    (fetcher, cache)
}
