//! Geography definitions: ordered clipping layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cql2::Cql2Query;
use crate::error::{OverlayError, Result};

/// Boolean operation applied by a clipping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClippingOperation {
    Intersect,
    Difference,
}

impl ClippingOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intersect => "INTERSECT",
            Self::Difference => "DIFFERENCE",
        }
    }
}

impl FromStr for ClippingOperation {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INTERSECT" => Ok(Self::Intersect),
            "DIFFERENCE" => Ok(Self::Difference),
            other => Err(OverlayError::configuration(format!(
                "unknown clipping operation: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ClippingOperation {
    type Error = OverlayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ClippingOperation> for String {
    fn from(op: ClippingOperation) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for ClippingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a geography: a source, an optional filter and an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClippingLayerOption {
    pub source: String,
    #[serde(default)]
    pub cql2_query: Option<Cql2Query>,
    pub op: ClippingOperation,
}

impl ClippingLayerOption {
    pub fn intersect(source: impl Into<String>, cql2_query: Option<Cql2Query>) -> Self {
        Self {
            source: source.into(),
            cql2_query,
            op: ClippingOperation::Intersect,
        }
    }

    pub fn difference(source: impl Into<String>, cql2_query: Option<Cql2Query>) -> Self {
        Self {
            source: source.into(),
            cql2_query,
            op: ClippingOperation::Difference,
        }
    }
}

/// Ordered clipping layers, applied left to right.
pub type Geography = Vec<ClippingLayerOption>;

/// Parse a geography from its JSON array form.
pub fn parse_geography(json: &str) -> Result<Geography> {
    serde_json::from_str(json)
        .map_err(|e| OverlayError::configuration(format!("invalid geography: {}", e)))
}

/// Merge runs of consecutive DIFFERENCE layers that read the same source.
///
/// `A - B - C` equals `A - (B ∪ C)`, so adjacent subtractions from one
/// source become a single layer whose filter is the OR of theirs. Layers
/// are never reordered and INTERSECT layers are kept as given.
pub fn consolidate(layers: &[ClippingLayerOption]) -> Geography {
    let mut consolidated: Geography = Vec::with_capacity(layers.len());

    for layer in layers {
        if let Some(last) = consolidated.last_mut() {
            if layer.op == ClippingOperation::Difference
                && last.op == ClippingOperation::Difference
                && last.source == layer.source
            {
                last.cql2_query = Cql2Query::or(last.cql2_query.take(), layer.cql2_query.clone());
                continue;
            }
        }
        consolidated.push(layer.clone());
    }

    consolidated
}

/// Encoding of a feature source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    FlatGeobuf,
}

impl FromStr for SourceFormat {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FlatGeobuf" | "flatgeobuf" | "fgb" => Ok(Self::FlatGeobuf),
            other => Err(OverlayError::configuration(format!(
                "Unsupported source type: {}",
                other
            ))),
        }
    }
}
