//! Geography overlay engine.
//!
//! Computes how much of a base dataset falls inside a *geography*: an
//! ordered list of clipping layers, each an INTERSECT or DIFFERENCE against
//! the features of a FlatGeobuf source, optionally filtered by a CQL2
//! attribute query. Results are areas (or lengths, or counts) per class of a
//! group-by attribute, and can be turned into report-card [`Metric`]s.
//!
//! # Architecture
//!
//! ```text
//! calculate_geography_overlap(geography, cache, source_url, ..)
//!      │
//!      ├─► geography::consolidate      merge adjacent DIFFERENCE layers
//!      │
//!      ├─► load base features          SourceCache::get(source_url).query(bounds)
//!      │
//!      ├─► for each layer
//!      │      └─► clipping::apply
//!      │             ├─► query layer source with working envelopes,
//!      │             │   split at the antimeridian
//!      │             ├─► cql2 filter + OverlayHooks::log_feature
//!      │             ├─► union candidates into one mask
//!      │             ├─► container::ContainerIndex  inside / outside / mixed
//!      │             └─► intersect / subtract the mixed features
//!      │
//!      └─► classify::classify          per-class area, length, count, stats
//! ```
//!
//! Fragment metrics computed separately can be merged with
//! [`combine_metrics_for_fragments`].
//!
//! # Example
//!
//! ```ignore
//! use overlay_engine::{calculate_geography_overlap, parse_geography, TracingHooks};
//!
//! let geography = parse_geography(r#"[
//!     {"source": "https://example.com/eez.fgb", "op": "INTERSECT",
//!      "cql2Query": {"op": "=", "args": [{"property": "MRGID_EEZ"}, 8325]}},
//!     {"source": "https://example.com/land.fgb", "op": "DIFFERENCE"}
//! ]"#)?;
//!
//! let output = calculate_geography_overlap(
//!     &geography,
//!     &cache,
//!     "https://example.com/habitats.fgb",
//!     "FlatGeobuf",
//!     Some("class"),
//!     &TracingHooks,
//! )
//! .await?;
//! println!("{:?}", output.area_by_class());
//! ```

pub mod classify;
pub mod clipping;
pub mod container;
pub mod cql2;
pub mod debug_writer;
pub mod error;
pub mod geography;
pub mod geometry;
pub mod hooks;
pub mod metrics;
pub mod overlay;

// Re-export commonly used types at crate root
pub use classify::{class_key, classify, ClassMetrics, OverlayOutput, TOTAL_CLASS, UNCLASSIFIED_CLASS};
pub use clipping::{WorkingFeature, WorkingSet};
pub use container::{ContainerIndex, Containment};
pub use cql2::{CompareOp, Cql2Query};
pub use debug_writer::DebugFeatureWriter;
pub use error::{OverlayError, Result};
pub use geography::{
    consolidate, parse_geography, ClippingLayerOption, ClippingOperation, Geography, SourceFormat,
};
pub use geometry::WorkingGeometry;
pub use hooks::{
    FeatureLayerLogConfig, FieldType, LoggedFeature, NoopHooks, OverlayHooks, TracingHooks,
};
pub use metrics::{
    combine_metrics_for_fragments, find_primary_geography_id, hash_metric_dependency, Metric,
    MetricSubject, MetricValue, UniqueIdIndex,
};
pub use overlay::{
    calculate_geography_overlap, calculate_geography_overlap_with_options, OverlayOptions,
    OverlayState,
};
