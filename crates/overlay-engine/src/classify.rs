//! Classification of the clipped working set into per-class metrics.

use std::collections::BTreeMap;

use fgb_source::Value;
use serde::{Deserialize, Serialize};

use crate::clipping::{WorkingFeature, WorkingSet};
use crate::metrics::{
    downsample_histogram, ColumnValueStats, CountValue, DistinctValueStats, Metric, MetricSubject,
    MetricValue, NumberColumnValueStats, UniqueIdIndex, MAX_HISTOGRAM_ENTRIES,
};

/// Class key holding the totals of every feature.
pub const TOTAL_CLASS: &str = "*";

/// Class key of features without a value for the group-by attribute.
pub const UNCLASSIFIED_CLASS: &str = "unclassified";

/// Class key for a base feature's properties.
pub fn class_key(group_by: Option<&str>, properties: &BTreeMap<String, Value>) -> Option<String> {
    let attribute = group_by?;
    match properties.get(attribute) {
        Some(value) if !value.is_null() => Some(value.to_string()),
        _ => Some(UNCLASSIFIED_CLASS.to_string()),
    }
}

static EMPTY_CLASS: ClassMetrics = ClassMetrics {
    area_sq_km: 0.0,
    length_km: 0.0,
    count: 0,
    unique_ids: UniqueIdIndex {
        ranges: Vec::new(),
        individuals: Vec::new(),
    },
    columns: BTreeMap::new(),
};

/// Metrics of one class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassMetrics {
    /// Spherical area in km².
    pub area_sq_km: f64,
    /// Great-circle length in km.
    pub length_km: f64,
    /// Distinct features with geometry left after clipping.
    pub count: u64,
    pub unique_ids: UniqueIdIndex,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, ColumnValueStats>,
}

/// Result of an overlay computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayOutput {
    pub group_by: Option<String>,
    /// Per-class metrics. Always contains [`TOTAL_CLASS`].
    pub classes: BTreeMap<String, ClassMetrics>,
}

impl OverlayOutput {
    /// Metrics for the ungrouped total.
    pub fn total(&self) -> &ClassMetrics {
        self.classes.get(TOTAL_CLASS).unwrap_or(&EMPTY_CLASS)
    }

    /// Area by class key.
    pub fn area_by_class(&self) -> BTreeMap<String, f64> {
        self.classes
            .iter()
            .map(|(key, metrics)| (key.clone(), metrics.area_sq_km))
            .collect()
    }

    /// Length by class key.
    pub fn length_by_class(&self) -> BTreeMap<String, f64> {
        self.classes
            .iter()
            .map(|(key, metrics)| (key.clone(), metrics.length_km))
            .collect()
    }

    /// Report-card metrics for `subject`.
    ///
    /// Emits `overlay_area` and `count` metrics, plus `overlay_length` when
    /// lineal features remain and `column_values` when column statistics
    /// were requested.
    pub fn to_metrics(&self, subject: MetricSubject, source_url: &str) -> Vec<Metric> {
        let mut parameters = BTreeMap::new();
        if let Some(group_by) = &self.group_by {
            parameters.insert("groupBy".to_string(), serde_json::Value::from(group_by.clone()));
        }

        let metric = |value: MetricValue| Metric {
            subject: subject.clone(),
            value,
            source_url: Some(source_url.to_string()),
            parameters: parameters.clone(),
        };

        let mut metrics = vec![
            metric(MetricValue::OverlayArea(self.area_by_class())),
            metric(MetricValue::Count(
                self.classes
                    .iter()
                    .map(|(key, m)| {
                        (
                            key.clone(),
                            CountValue {
                                count: m.count,
                                unique_id_index: m.unique_ids.clone(),
                            },
                        )
                    })
                    .collect(),
            )),
        ];

        if self.classes.values().any(|m| m.length_km > 0.0) {
            metrics.push(metric(MetricValue::OverlayLength(self.length_by_class())));
        }

        if self.classes.values().any(|m| !m.columns.is_empty()) {
            metrics.push(metric(MetricValue::ColumnValues(
                self.classes
                    .iter()
                    .map(|(key, m)| (key.clone(), m.columns.clone()))
                    .collect(),
            )));
        }

        metrics
    }
}

/// Group the working set by class key.
///
/// Every class key recorded in the working set appears in the output, with
/// zero values when clipping removed all of its features.
pub fn classify(working: &WorkingSet, group_by: Option<&str>, stats_columns: &[String]) -> OverlayOutput {
    let mut members: BTreeMap<String, Vec<&WorkingFeature>> = BTreeMap::new();
    members.insert(TOTAL_CLASS.to_string(), Vec::new());
    for key in working.class_keys() {
        members.entry(key.clone()).or_default();
    }

    for feature in working.features() {
        if let Some(total) = members.get_mut(TOTAL_CLASS) {
            total.push(feature);
        }
        if let Some(key) = &feature.class_key {
            if key != TOTAL_CLASS {
                members.entry(key.clone()).or_default().push(feature);
            }
        }
    }

    let classes = members
        .into_iter()
        .map(|(key, features)| (key, class_metrics(&features, stats_columns)))
        .collect();

    OverlayOutput {
        group_by: group_by.map(str::to_string),
        classes,
    }
}

fn class_metrics(features: &[&WorkingFeature], stats_columns: &[String]) -> ClassMetrics {
    let area_sq_km: f64 = features.iter().map(|f| f.geometry.area_sq_km()).sum();
    let length_km: f64 = features.iter().map(|f| f.geometry.length_km()).sum();
    let unique_ids = UniqueIdIndex::from_ids(features.iter().map(|f| f.id));

    let mut columns = BTreeMap::new();
    for column in stats_columns {
        let values: Vec<&Value> = features
            .iter()
            .filter_map(|f| f.properties.get(column))
            .filter(|v| !v.is_null())
            .collect();
        if let Some(stats) = column_stats(&values, area_sq_km) {
            columns.insert(column.clone(), stats);
        }
    }

    ClassMetrics {
        area_sq_km,
        length_km,
        count: unique_ids.count(),
        unique_ids,
        columns,
    }
}

/// Statistics of one attribute over a class. Numeric when any value is a
/// number, otherwise distinct-value counts.
fn column_stats(values: &[&Value], area_sq_km: f64) -> Option<ColumnValueStats> {
    if values.is_empty() {
        return None;
    }

    if values.iter().any(|v| v.as_f64().is_some()) {
        let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
        return Some(ColumnValueStats::Number(number_stats(&numbers, area_sq_km)));
    }

    let mut distinct: Vec<(Value, u64)> = Vec::new();
    for value in values {
        match distinct.iter_mut().find(|(v, _)| v == *value) {
            Some(entry) => entry.1 += 1,
            None => distinct.push(((*value).clone(), 1)),
        }
    }
    let stats = DistinctValueStats {
        count_distinct: distinct.len() as u64,
        distinct_values: distinct,
    };

    Some(if values.iter().all(|v| v.as_bool().is_some()) {
        ColumnValueStats::Boolean(stats)
    } else {
        ColumnValueStats::String(stats)
    })
}

fn number_stats(values: &[f64], area_sq_km: f64) -> NumberColumnValueStats {
    let count = values.len();
    let sum: f64 = values.iter().sum();
    let mean = sum / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut histogram: BTreeMap<u64, (f64, u64)> = BTreeMap::new();
    for v in values {
        histogram.entry(v.to_bits()).or_insert((*v, 0)).1 += 1;
    }
    let count_distinct = histogram.len() as u64;
    let mut histogram: Vec<(f64, u64)> = histogram.into_values().collect();
    histogram.sort_by(|a, b| a.0.total_cmp(&b.0));

    NumberColumnValueStats {
        count: count as u64,
        min,
        max,
        mean,
        std_dev: variance.sqrt(),
        histogram: downsample_histogram(histogram, MAX_HISTOGRAM_ENTRIES),
        count_distinct,
        sum,
        total_area_sq_km: (area_sq_km > 0.0).then_some(area_sq_km),
    }
}
