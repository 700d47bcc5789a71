//! Clipping operation executor.
//!
//! Applies one clipping layer to the working set: candidate features are
//! read from the layer's source, filtered and unioned into a single mask.
//! Working features entirely inside or outside the mask are kept or dropped
//! as they are; the rest are intersected with or subtracted from it.

use std::collections::{BTreeMap, BTreeSet};

use fgb_source::{ColumnMeta, Envelope, FlatGeobufSource, SourceCache, Value};
use futures::TryStreamExt;
use geo_types::MultiPolygon;
use tracing::{debug, instrument};

use crate::container::{Containment, ContainerIndex};
use crate::error::Result;
use crate::geography::{ClippingLayerOption, ClippingOperation};
use crate::geometry::{clipping_polygons, sanitize, union_all, WorkingGeometry};
use crate::hooks::{coerce_properties, FeatureLayerLogConfig, FieldType, LoggedFeature, OverlayHooks};

/// A base feature with its current, possibly clipped, geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingFeature {
    pub id: u64,
    /// Value of the group-by attribute, if the feature has one.
    pub class_key: Option<String>,
    pub properties: BTreeMap<String, Value>,
    pub geometry: WorkingGeometry,
    pub envelope: Envelope,
}

/// Base features still present after the layers applied so far, plus every
/// class key seen when the base source was loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingSet {
    features: Vec<WorkingFeature>,
    class_keys: BTreeSet<String>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature. Empty geometries are not kept but their class key is.
    pub fn push(&mut self, feature: WorkingFeature) {
        if let Some(key) = &feature.class_key {
            self.class_keys.insert(key.clone());
        }
        if !feature.geometry.is_empty() {
            self.features.push(feature);
        }
    }

    /// Record a class key without a feature.
    pub fn insert_class_key(&mut self, key: impl Into<String>) {
        self.class_keys.insert(key.into());
    }

    pub fn features(&self) -> &[WorkingFeature] {
        &self.features
    }

    pub fn class_keys(&self) -> &BTreeSet<String> {
        &self.class_keys
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Envelope of every feature, or `None` when empty.
    pub fn envelope(&self) -> Option<Envelope> {
        let mut envelope = Envelope::empty();
        for feature in &self.features {
            envelope.expand(&feature.envelope);
        }
        (!envelope.is_empty()).then_some(envelope)
    }

    /// Query envelopes of every feature, split at the antimeridian.
    fn envelopes(&self) -> Vec<Envelope> {
        self.features
            .iter()
            .flat_map(|f| f.envelope.split_antimeridian())
            .collect()
    }
}

/// Log configuration for the candidate features of layer `index`, with one
/// field per source column.
pub fn layer_log_config(
    index: usize,
    layer: &ClippingLayerOption,
    source: &FlatGeobufSource,
) -> FeatureLayerLogConfig {
    let name = format!("layer-{}-{}", index, layer.op.as_str().to_ascii_lowercase());
    let mut config = FeatureLayerLogConfig::new(name, source.header().geometry_type);
    for column in source.columns() {
        config = config.with_field(column.name.clone(), field_type(column));
    }
    config
}

fn field_type(column: &ColumnMeta) -> FieldType {
    if column.is_boolean() {
        FieldType::Boolean
    } else if column.is_numeric() {
        FieldType::Number
    } else {
        FieldType::String
    }
}

/// Apply `layer` to `working`.
///
/// Matching candidates are passed to [`OverlayHooks::log_feature`] as they
/// are read. Features emptied by the operation are dropped from the result.
#[instrument(skip_all, fields(layer = index, op = %layer.op, source = %layer.source))]
pub async fn apply(
    working: WorkingSet,
    layer: &ClippingLayerOption,
    index: usize,
    cache: &SourceCache,
    hooks: &dyn OverlayHooks,
) -> Result<WorkingSet> {
    if working.is_empty() {
        debug!("Working set is empty, skipping layer");
        return Ok(working);
    }

    let source = cache.get(&layer.source).await?;
    let log_config = layer_log_config(index, layer, &source);

    let mut polygons = Vec::new();
    let mut read = 0usize;
    let mut matched = 0usize;
    let mut candidates = source.query(&working.envelopes());
    while let Some(feature) = candidates.try_next().await? {
        read += 1;
        if let Some(query) = &layer.cql2_query {
            if !query.evaluate(&feature.properties) {
                continue;
            }
        }
        matched += 1;

        hooks.log_feature(
            &log_config,
            &LoggedFeature {
                id: feature.id,
                properties: coerce_properties(&log_config, &feature.properties),
                geometry: feature.geometry.clone(),
            },
        );
        polygons.extend(clipping_polygons(feature.geometry)?);
    }

    let mask = union_all(sanitize(MultiPolygon(polygons))?.0)?;
    debug!(read, matched, mask_polygons = mask.0.len(), "Candidates unioned");
    hooks.log(&format!(
        "{} {}: {} of {} candidate features matched",
        layer.op, layer.source, matched, read
    ));

    clip(working, layer.op, &mask)
}

/// Apply `op` with an already unioned mask.
pub fn clip(working: WorkingSet, op: ClippingOperation, mask: &MultiPolygon<f64>) -> Result<WorkingSet> {
    let index = ContainerIndex::new(mask);
    let WorkingSet {
        features,
        class_keys,
    } = working;

    let mut result = WorkingSet {
        features: Vec::with_capacity(features.len()),
        class_keys,
    };
    let (mut inside, mut outside, mut mixed) = (0usize, 0usize, 0usize);

    for mut feature in features {
        let containment = index.classify(&feature.geometry, &feature.envelope);
        match containment {
            Containment::Inside => inside += 1,
            Containment::Outside => outside += 1,
            Containment::Mixed => mixed += 1,
        }

        let geometry = match (op, containment) {
            (ClippingOperation::Intersect, Containment::Outside)
            | (ClippingOperation::Difference, Containment::Inside) => continue,
            (ClippingOperation::Intersect, Containment::Inside)
            | (ClippingOperation::Difference, Containment::Outside) => {
                result.features.push(feature);
                continue;
            }
            (ClippingOperation::Intersect, Containment::Mixed) => feature.geometry.intersect(mask)?,
            (ClippingOperation::Difference, Containment::Mixed) => feature.geometry.subtract(mask)?,
        };

        match geometry.envelope() {
            Some(envelope) if !geometry.is_empty() => {
                feature.geometry = geometry;
                feature.envelope = envelope;
                result.features.push(feature);
            }
            _ => {}
        }
    }

    debug!(
        inside,
        outside,
        mixed,
        boundary_segments = index.segment_count(),
        "Features classified against mask"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, Coord, Rect};

    fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![
            Rect::new(Coord { x, y }, Coord { x: x + size, y: y + size }).to_polygon()
        ])
    }

    fn feature(id: u64, class: &str, geometry: MultiPolygon<f64>) -> WorkingFeature {
        let geometry = WorkingGeometry::Polygonal(geometry);
        WorkingFeature {
            id,
            class_key: Some(class.to_string()),
            properties: BTreeMap::new(),
            envelope: geometry.envelope().unwrap(),
            geometry,
        }
    }

    impl WorkingFeature {
        fn geometry_area(&self) -> f64 {
            match &self.geometry {
                WorkingGeometry::Polygonal(mp) => geo::Area::unsigned_area(mp),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn working() -> WorkingSet {
        let mut set = WorkingSet::new();
        set.push(feature(0, "A", square(0.0, 0.0, 2.0)));
        set.push(feature(1, "B", square(10.0, 10.0, 1.0)));
        set
    }

    #[test]
    fn test_intersect_drops_disjoint_features() {
        let result = clip(working(), ClippingOperation::Intersect, &square(1.0, 1.0, 5.0)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.features()[0].id, 0);
        let env = result.features()[0].envelope;
        for (actual, expected) in [(env.min_x, 1.0), (env.min_y, 1.0), (env.max_x, 2.0), (env.max_y, 2.0)] {
            assert!((actual - expected).abs() < 1e-9);
        }
        // class keys survive
        assert!(result.class_keys().contains("B"));
    }

    #[test]
    fn test_difference_keeps_disjoint_features_untouched() {
        let before = working();
        let result = clip(before.clone(), ClippingOperation::Difference, &square(-1.0, -1.0, 5.0)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.features()[0], before.features()[1]);
    }

    #[test]
    fn test_empty_mask() {
        let empty = MultiPolygon(vec![]);
        assert!(clip(working(), ClippingOperation::Intersect, &empty).unwrap().is_empty());
        assert_eq!(clip(working(), ClippingOperation::Difference, &empty).unwrap(), working());
    }

    #[test]
    fn test_contained_features_skip_boolean_operations() {
        // Returned as is rather than rebuilt by an intersection
        let triangle = MultiPolygon(vec![geo_types::polygon![
            (x: 1.0, y: 1.0), (x: 3.0, y: 1.0), (x: 2.0, y: 3.0),
        ]]);
        let mut set = WorkingSet::new();
        set.push(feature(0, "A", triangle));
        let mask = square(0.0, 0.0, 5.0);

        let kept = clip(set.clone(), ClippingOperation::Intersect, &mask).unwrap();
        assert_eq!(kept, set);
        assert!(clip(set, ClippingOperation::Difference, &mask).unwrap().is_empty());
    }

    #[test]
    fn test_feature_around_mask_is_clipped() {
        let mut set = WorkingSet::new();
        set.push(feature(0, "A", square(0.0, 0.0, 10.0)));
        let mask = square(4.0, 4.0, 2.0);

        let inner = clip(set.clone(), ClippingOperation::Intersect, &mask).unwrap();
        assert!((inner.features()[0].geometry_area() - 4.0).abs() < 1e-9);
        let outer = clip(set, ClippingOperation::Difference, &mask).unwrap();
        assert!((outer.features()[0].geometry_area() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_query_envelopes_split_at_antimeridian() {
        let mut set = WorkingSet::new();
        set.push(feature(0, "A", square(178.0, -18.0, 4.0)));
        set.push(feature(1, "B", square(10.0, 10.0, 1.0)));
        assert_eq!(
            set.envelopes(),
            vec![
                Envelope::new(178.0, -18.0, 180.0, -14.0),
                Envelope::new(-180.0, -18.0, -178.0, -14.0),
                Envelope::new(10.0, 10.0, 11.0, 11.0),
            ]
        );
    }

    #[test]
    fn test_working_set_envelope() {
        assert_eq!(working().envelope(), Some(Envelope::new(0.0, 0.0, 11.0, 11.0)));
        assert_eq!(WorkingSet::new().envelope(), None);
    }
}
