//! Integration tests for SourceCache sharing and eviction.

use std::collections::BTreeMap;
use std::sync::Arc;

use fgb_source::{
    ColumnKind, ColumnSpec, Envelope, FgbWriter, GeometryType, InMemoryRangeFetcher, SourceCache,
    SourceCacheConfig, Value,
};
use futures::TryStreamExt;
use geo_types::{point, Geometry};

fn points_fgb(n: usize) -> Vec<u8> {
    let mut writer = FgbWriter::new(
        "points",
        GeometryType::Point,
        vec![ColumnSpec::new("id", ColumnKind::Long)],
    );
    for i in 0..n {
        let mut props = BTreeMap::new();
        props.insert("id".to_string(), Value::Number(i as f64));
        writer.add_feature(Geometry::Point(point!(x: i as f64, y: 0.0)), props);
    }
    writer.to_bytes().unwrap()
}

fn setup(config: SourceCacheConfig) -> (Arc<InMemoryRangeFetcher>, SourceCache) {
    let fetcher = Arc::new(InMemoryRangeFetcher::new());
    fetcher.insert("mem://a.fgb", points_fgb(50));
    fetcher.insert("mem://b.fgb", points_fgb(50));
    let cache = SourceCache::new(config, fetcher.clone()).unwrap();
    (fetcher, cache)
}

// =============================================================================
// Sharing
// =============================================================================

#[tokio::test]
async fn test_same_url_returns_same_source() {
    let (_fetcher, cache) = setup(SourceCacheConfig::default());

    let a1 = cache.get("mem://a.fgb").await.unwrap();
    let a2 = cache.get("mem://a.fgb").await.unwrap();
    let b = cache.get("mem://b.fgb").await.unwrap();

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
    assert_eq!(cache.len().await, 2);
}

#[tokio::test]
async fn test_cached_source_makes_no_new_requests() {
    let (fetcher, cache) = setup(SourceCacheConfig::default());

    cache.get("mem://a.fgb").await.unwrap();
    let after_open = fetcher.fetch_count();
    let source = cache.get("mem://a.fgb").await.unwrap();
    assert_eq!(fetcher.fetch_count(), after_open);

    let features: Vec<_> = source
        .query(&[Envelope::new(-0.5, -1.0, 4.5, 1.0)])
        .try_collect()
        .await
        .unwrap();
    assert_eq!(features.len(), 5);
}

#[tokio::test]
async fn test_concurrent_gets_share_one_open() {
    let (fetcher, cache) = setup(SourceCacheConfig::default());
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("mem://a.fgb").await })
        })
        .collect();

    let mut sources = Vec::new();
    for handle in handles {
        sources.push(handle.await.unwrap().unwrap());
    }
    assert!(Arc::ptr_eq(&sources[0], &sources[1]));
    assert!(Arc::ptr_eq(&sources[1], &sources[2]));

    // A single open reads the header and the last feature's size prefix
    let (single, single_cache) = setup(SourceCacheConfig::default());
    single_cache.get("mem://a.fgb").await.unwrap();
    assert_eq!(fetcher.fetch_count(), single.fetch_count());
}

#[tokio::test]
async fn test_failed_open_is_retried() {
    let (fetcher, cache) = setup(SourceCacheConfig::default());
    fetcher.fail_url("mem://a.fgb");
    assert!(cache.get("mem://a.fgb").await.is_err());
    assert!(cache.is_empty().await);

    fetcher.recover("mem://a.fgb");
    let source = cache.get("mem://a.fgb").await.unwrap();
    assert_eq!(source.feature_count(), 50);
}

#[tokio::test]
async fn test_query_convenience() {
    let (_fetcher, cache) = setup(SourceCacheConfig::default());
    let features: Vec<_> = cache
        .query("mem://b.fgb", &[Envelope::new(9.5, -1.0, 10.5, 1.0)])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].property("id"), Some(&Value::Number(10.0)));
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_sources_evicted_by_index_size() {
    // 50 leaves + 4 + 1 root = 55 nodes of 40 bytes
    let one_index = 55 * 40;
    let config = SourceCacheConfig {
        max_index_size: one_index + 100,
        ..Default::default()
    };
    let (_fetcher, cache) = setup(config);

    let a = cache.get("mem://a.fgb").await.unwrap();
    assert_eq!(a.index_size_bytes(), one_index);
    cache.get("mem://b.fgb").await.unwrap();

    assert_eq!(cache.len().await, 1);
    assert!(cache.index_bytes().await <= one_index + 100);

    // Evicted source is reopened as a new instance
    let a2 = cache.get("mem://a.fgb").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &a2));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = SourceCacheConfig {
        page_size: 0,
        ..Default::default()
    };
    let fetcher = Arc::new(InMemoryRangeFetcher::new());
    assert!(SourceCache::new(config, fetcher).is_err());
}
