//! Callbacks invoked while an overlay is computed.

use std::collections::BTreeMap;

use fgb_source::{GeometryType, Value};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Declared type of a logged attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

/// Describes a layer of logged features: its name, geometry type and the
/// attributes kept on each feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayerLogConfig {
    pub name: String,
    pub geometry_type: GeometryType,
    pub fields: BTreeMap<String, FieldType>,
}

impl FeatureLayerLogConfig {
    pub fn new(name: impl Into<String>, geometry_type: GeometryType) -> Self {
        Self {
            name: name.into(),
            geometry_type,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }
}

/// A feature handed to [`OverlayHooks::log_feature`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedFeature {
    pub id: u64,
    pub geometry: Geometry<f64>,
    pub properties: BTreeMap<String, Value>,
}

/// Observer of an overlay computation. Every method defaults to a no-op.
pub trait OverlayHooks: Send + Sync {
    /// Free-form diagnostic message.
    fn log(&self, _message: &str) {}

    /// A feature read from a source while processing `layer`.
    fn log_feature(&self, _layer: &FeatureLayerLogConfig, _feature: &LoggedFeature) {}

    /// Percent complete (0-100, never decreasing) and a short status.
    fn progress(&self, _percent: f64, _message: &str) {}
}

/// Hooks that ignore every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl OverlayHooks for NoopHooks {}

/// Hooks that forward to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl OverlayHooks for TracingHooks {
    fn log(&self, message: &str) {
        info!(target: "overlay", "{}", message);
    }

    fn log_feature(&self, layer: &FeatureLayerLogConfig, feature: &LoggedFeature) {
        debug!(target: "overlay", layer = %layer.name, feature_id = feature.id, "Feature");
    }

    fn progress(&self, percent: f64, message: &str) {
        info!(target: "overlay", percent = percent, "{}", message);
    }
}

/// Reduce `properties` to the fields declared by `config`.
///
/// Undeclared keys are dropped and declared keys missing from the feature
/// stay missing. Booleans are logged as `"true"`/`"false"`, numeric strings
/// in number fields become numbers and values that cannot be represented
/// become `null`.
pub fn coerce_properties(
    config: &FeatureLayerLogConfig,
    properties: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    config
        .fields
        .iter()
        .filter_map(|(name, field_type)| {
            let value = properties.get(name)?;
            Some((name.clone(), coerce(*field_type, value)))
        })
        .collect()
}

fn coerce(field_type: FieldType, value: &Value) -> Value {
    match (field_type, value) {
        (_, Value::Null) => Value::Null,
        (_, Value::Boolean(b)) => match field_type {
            FieldType::Number => Value::Null,
            _ => Value::String(b.to_string()),
        },
        (FieldType::Number, Value::Number(n)) => Value::Number(*n),
        (FieldType::Number, Value::String(s)) => {
            s.trim().parse::<f64>().map(Value::Number).unwrap_or(Value::Null)
        }
        (FieldType::String, v @ Value::Number(_)) => Value::String(v.to_string()),
        (FieldType::Boolean, Value::Number(_)) => Value::Null,
        (_, Value::String(s)) => Value::String(s.clone()),
    }
}
