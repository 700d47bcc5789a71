//! Writes logged features to local FlatGeobuf files for inspection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fgb_source::{ColumnKind, ColumnSpec, FgbWriter, GeometryType, Value};
use tracing::{info, warn};

use crate::hooks::{FeatureLayerLogConfig, FieldType, LoggedFeature, OverlayHooks};

struct LayerBuffer {
    config: FeatureLayerLogConfig,
    features: Vec<LoggedFeature>,
}

/// [`OverlayHooks`] implementation that keeps every logged feature and
/// writes one indexed `.fgb` file per layer on [`finish`](Self::finish).
///
/// Calls are forwarded to an optional delegate. Failures to create the
/// output directory or write a file are logged and otherwise ignored.
pub struct DebugFeatureWriter {
    dir: Option<PathBuf>,
    delegate: Option<Arc<dyn OverlayHooks>>,
    layers: Mutex<BTreeMap<String, LayerBuffer>>,
}

impl DebugFeatureWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let dir = match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot create debug output directory");
                None
            }
        };
        Self {
            dir,
            delegate: None,
            layers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Forward every hook call to `delegate` as well.
    pub fn with_delegate(mut self, delegate: Arc<dyn OverlayHooks>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Write buffered layers and return the paths written.
    pub fn finish(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let layers = match self.layers.lock() {
            Ok(mut layers) => std::mem::take(&mut *layers),
            Err(_) => {
                warn!("Debug feature buffer poisoned, nothing written");
                return Vec::new();
            }
        };

        let mut written = Vec::with_capacity(layers.len());
        for (name, layer) in layers {
            let path = dir.join(format!("{}.fgb", file_stem(&name)));
            match write_layer(&path, &layer) {
                Ok(()) => {
                    info!(path = %path.display(), features = layer.features.len(), "Wrote debug layer");
                    written.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write debug layer"),
            }
        }
        written
    }
}

impl OverlayHooks for DebugFeatureWriter {
    fn log(&self, message: &str) {
        if let Some(delegate) = &self.delegate {
            delegate.log(message);
        }
    }

    fn log_feature(&self, layer: &FeatureLayerLogConfig, feature: &LoggedFeature) {
        if self.dir.is_some() {
            if let Ok(mut layers) = self.layers.lock() {
                layers
                    .entry(layer.name.clone())
                    .or_insert_with(|| LayerBuffer {
                        config: layer.clone(),
                        features: Vec::new(),
                    })
                    .features
                    .push(feature.clone());
            }
        }
        if let Some(delegate) = &self.delegate {
            delegate.log_feature(layer, feature);
        }
    }

    fn progress(&self, percent: f64, message: &str) {
        if let Some(delegate) = &self.delegate {
            delegate.progress(percent, message);
        }
    }
}

fn write_layer(path: &Path, layer: &LayerBuffer) -> fgb_source::Result<()> {
    let columns = layer
        .config
        .fields
        .iter()
        .map(|(name, field_type)| ColumnSpec::new(name.clone(), column_kind(*field_type)))
        .collect();

    // features keep their own geometry type
    let mut writer = FgbWriter::new(layer.config.name.clone(), GeometryType::Unknown, columns);
    for feature in &layer.features {
        let properties = feature
            .properties
            .iter()
            .map(|(key, value)| (key.clone(), debug_value(value)))
            .collect();
        writer.add_feature(feature.geometry.clone(), properties);
    }
    writer.write_to(path)
}

fn column_kind(field_type: FieldType) -> ColumnKind {
    match field_type {
        FieldType::Number => ColumnKind::Double,
        FieldType::String | FieldType::Boolean => ColumnKind::String,
    }
}

fn debug_value(value: &Value) -> Value {
    match value {
        Value::Boolean(b) => Value::String(b.to_string()),
        other => other.clone(),
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{Coord, Geometry, Rect};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl OverlayHooks for Counting {
        fn log_feature(&self, _layer: &FeatureLayerLogConfig, _feature: &LoggedFeature) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn logged(id: u64, sovereign: bool) -> LoggedFeature {
        let mut properties = BTreeMap::new();
        properties.insert("id".to_string(), Value::Number(id as f64));
        properties.insert("sovereign".to_string(), Value::Boolean(sovereign));
        LoggedFeature {
            id,
            geometry: Geometry::Polygon(
                Rect::new(Coord { x: id as f64, y: 0.0 }, Coord { x: id as f64 + 1.0, y: 1.0 })
                    .to_polygon(),
            ),
            properties,
        }
    }

    fn config(name: &str) -> FeatureLayerLogConfig {
        FeatureLayerLogConfig::new(name, GeometryType::Polygon)
            .with_field("id", FieldType::Number)
            .with_field("sovereign", FieldType::Boolean)
    }

    #[test]
    fn test_writes_one_file_per_layer() {
        let dir = tempfile::tempdir().unwrap();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let writer = DebugFeatureWriter::new(dir.path()).with_delegate(counting.clone());

        writer.log_feature(&config("layer-0-intersect"), &logged(1, true));
        writer.log_feature(&config("layer-0-intersect"), &logged(2, false));
        writer.log_feature(&config("layer/1 difference"), &logged(3, true));

        let written = writer.finish();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|p| p.exists()));
        assert!(written
            .iter()
            .any(|p| p.file_name().unwrap() == "layer_1_difference.fgb"));
        assert_eq!(counting.0.load(Ordering::SeqCst), 3);

        // buffers are drained
        assert!(writer.finish().is_empty());
    }

    #[test]
    fn test_unwritable_directory_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let writer = DebugFeatureWriter::new(file.join("nested"));
        writer.log_feature(&config("layer-0-intersect"), &logged(1, true));
        assert!(writer.finish().is_empty());
    }

    #[test]
    fn test_column_and_value_mapping() {
        assert_eq!(column_kind(FieldType::Number), ColumnKind::Double);
        assert_eq!(column_kind(FieldType::Boolean), ColumnKind::String);
        assert_eq!(debug_value(&Value::Boolean(false)), Value::from("false"));
    }
}
