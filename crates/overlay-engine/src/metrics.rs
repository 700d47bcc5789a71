//! Report-card metric contract.
//!
//! Metrics are computed per fragment or per geography and combined when a
//! report covers several fragments.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use fgb_source::Value;
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};

/// Largest histogram kept after combining column statistics.
pub const MAX_HISTOGRAM_ENTRIES: usize = 200;

/// What a metric was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricSubject {
    Fragment {
        hash: String,
        geographies: Vec<i64>,
        sketches: Vec<i64>,
    },
    Geography {
        id: i64,
    },
}

impl MetricSubject {
    pub fn geography(id: i64) -> Self {
        Self::Geography { id }
    }
}

pub fn subject_is_fragment(subject: &MetricSubject) -> bool {
    matches!(subject, MetricSubject::Fragment { .. })
}

pub fn subject_is_geography(subject: &MetricSubject) -> bool {
    matches!(subject, MetricSubject::Geography { .. })
}

/// Compressed set of feature ids: runs of consecutive ids as inclusive
/// ranges, everything else listed individually. Both lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueIdIndex {
    pub ranges: Vec<(u64, u64)>,
    pub individuals: Vec<u64>,
}

impl UniqueIdIndex {
    pub fn from_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        let spans = ids.into_iter().map(|id| (id, id)).collect();
        Self::from_spans(spans)
    }

    fn from_spans(mut spans: Vec<(u64, u64)>) -> Self {
        spans.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let mut index = Self::default();
        for (start, end) in merged {
            if start == end {
                index.individuals.push(start);
            } else {
                index.ranges.push((start, end));
            }
        }
        index
    }

    fn spans(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges
            .iter()
            .copied()
            .chain(self.individuals.iter().map(|&id| (id, id)))
    }

    /// Union of several indexes.
    pub fn merge<'a>(indexes: impl IntoIterator<Item = &'a UniqueIdIndex>) -> Self {
        let spans = indexes.into_iter().flat_map(|index| index.spans()).collect();
        Self::from_spans(spans)
    }

    /// Number of distinct ids.
    pub fn count(&self) -> u64 {
        self.spans().map(|(start, end)| end - start + 1).sum()
    }
}

/// Feature count of one class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountValue {
    pub count: u64,
    pub unique_id_index: UniqueIdIndex,
}

/// Statistics of a numeric attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberColumnValueStats {
    pub count: u64,
    #[serde(with = "nullable_f64")]
    pub min: f64,
    #[serde(with = "nullable_f64")]
    pub max: f64,
    #[serde(with = "nullable_f64")]
    pub mean: f64,
    #[serde(with = "nullable_f64")]
    pub std_dev: f64,
    /// `(value, count)` pairs sorted by value.
    pub histogram: Vec<(f64, u64)>,
    pub count_distinct: u64,
    pub sum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_area_sq_km: Option<f64>,
}

/// Distinct values of a string or boolean attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistinctValueStats {
    pub distinct_values: Vec<(Value, u64)>,
    pub count_distinct: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ColumnValueStats {
    Number(NumberColumnValueStats),
    String(DistinctValueStats),
    Boolean(DistinctValueStats),
}

/// Statistics of one raster band within a fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterBandStats {
    pub count: u64,
    #[serde(with = "nullable_f64")]
    pub min: f64,
    #[serde(with = "nullable_f64")]
    pub max: f64,
    #[serde(with = "nullable_f64")]
    pub mean: f64,
    #[serde(with = "nullable_f64")]
    pub median: f64,
    #[serde(with = "nullable_f64")]
    pub range: f64,
    pub histogram: Vec<(f64, u64)>,
    pub invalid: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterStatsValue {
    pub bands: Vec<RasterBandStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceTableValue {
    /// Feature records, each carrying a unique `__id`.
    pub values: Vec<serde_json::Map<String, serde_json::Value>>,
    pub exceeded_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceToShoreValue {
    pub meters: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Metric type and value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    TotalArea(f64),
    OverlayArea(BTreeMap<String, f64>),
    /// Length in km of lineal features by class.
    OverlayLength(BTreeMap<String, f64>),
    Count(BTreeMap<String, CountValue>),
    Presence(bool),
    PresenceTable(PresenceTableValue),
    ColumnValues(BTreeMap<String, BTreeMap<String, ColumnValueStats>>),
    RasterStats(RasterStatsValue),
    DistanceToShore(DistanceToShoreValue),
}

impl MetricValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TotalArea(_) => "total_area",
            Self::OverlayArea(_) => "overlay_area",
            Self::OverlayLength(_) => "overlay_length",
            Self::Count(_) => "count",
            Self::Presence(_) => "presence",
            Self::PresenceTable(_) => "presence_table",
            Self::ColumnValues(_) => "column_values",
            Self::RasterStats(_) => "raster_stats",
            Self::DistanceToShore(_) => "distance_to_shore",
        }
    }
}

/// A computed metric, serialized as
/// `{"subject", "type", "value", "sourceUrl", "parameters"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetric", into = "RawMetric")]
pub struct Metric {
    pub subject: MetricSubject,
    pub value: MetricValue,
    pub source_url: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetric {
    subject: MetricSubject,
    #[serde(rename = "type")]
    metric_type: String,
    value: serde_json::Value,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawMetric> for Metric {
    type Error = serde_json::Error;

    fn try_from(raw: RawMetric) -> std::result::Result<Self, Self::Error> {
        let value = serde_json::from_value(serde_json::json!({
            "type": raw.metric_type,
            "value": raw.value,
        }))?;
        Ok(Self {
            subject: raw.subject,
            value,
            source_url: raw.source_url,
            parameters: raw.parameters,
        })
    }
}

impl From<Metric> for RawMetric {
    fn from(metric: Metric) -> Self {
        let metric_type = metric.value.type_name().to_string();
        let value = serde_json::to_value(&metric.value)
            .ok()
            .and_then(|mut tagged| tagged.get_mut("value").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null);
        Self {
            subject: metric.subject,
            metric_type,
            value,
            source_url: metric.source_url,
            parameters: metric.parameters,
        }
    }
}

// ============================================================================
// Combination
// ============================================================================

/// Combine same-type metric values computed for several fragments into the
/// value for their union.
pub fn combine_metrics_for_fragments(values: &[MetricValue]) -> Result<MetricValue> {
    let first = values
        .first()
        .ok_or_else(|| OverlayError::metrics("Cannot combine empty array of metrics"))?;

    let types: BTreeSet<&str> = values.iter().map(MetricValue::type_name).collect();
    if types.len() > 1 {
        let types: Vec<&str> = types.into_iter().collect();
        return Err(OverlayError::metrics(format!(
            "All metrics must have the same type. Found types: {}",
            types.join(", ")
        )));
    }

    Ok(match first {
        MetricValue::TotalArea(_) => MetricValue::TotalArea(
            values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::TotalArea(area) => Some(*area),
                    _ => None,
                })
                .sum(),
        ),
        MetricValue::OverlayArea(_) => {
            let grouped: Vec<&BTreeMap<String, f64>> = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::OverlayArea(g) => Some(g),
                    _ => None,
                })
                .collect();
            MetricValue::OverlayArea(combine_grouped(&grouped, |areas| areas.iter().copied().sum()))
        }
        MetricValue::OverlayLength(_) => {
            let grouped: Vec<&BTreeMap<String, f64>> = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::OverlayLength(g) => Some(g),
                    _ => None,
                })
                .collect();
            MetricValue::OverlayLength(combine_grouped(&grouped, |lengths| lengths.iter().copied().sum()))
        }
        MetricValue::Count(_) => {
            let grouped: Vec<&BTreeMap<String, CountValue>> = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::Count(g) => Some(g),
                    _ => None,
                })
                .collect();
            MetricValue::Count(combine_grouped(&grouped, |counts| {
                let unique_id_index = UniqueIdIndex::merge(counts.iter().map(|c| &c.unique_id_index));
                CountValue {
                    count: unique_id_index.count(),
                    unique_id_index,
                }
            }))
        }
        MetricValue::Presence(_) => {
            MetricValue::Presence(values.iter().any(|v| matches!(v, MetricValue::Presence(true))))
        }
        MetricValue::PresenceTable(_) => {
            let mut seen = HashSet::new();
            let mut combined = PresenceTableValue {
                values: Vec::new(),
                exceeded_limit: false,
            };
            for value in values {
                if let MetricValue::PresenceTable(table) = value {
                    combined.exceeded_limit |= table.exceeded_limit;
                    for record in &table.values {
                        let id = record.get("__id").map(|id| id.to_string()).unwrap_or_default();
                        if seen.insert(id) {
                            combined.values.push(record.clone());
                        }
                    }
                }
            }
            MetricValue::PresenceTable(combined)
        }
        MetricValue::ColumnValues(_) => {
            let grouped: Vec<&BTreeMap<String, BTreeMap<String, ColumnValueStats>>> = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::ColumnValues(g) => Some(g),
                    _ => None,
                })
                .collect();
            MetricValue::ColumnValues(combine_grouped(&grouped, |entries| {
                combine_column_stats_by_attribute(entries)
            }))
        }
        MetricValue::RasterStats(_) => {
            let mut bands = Vec::with_capacity(values.len());
            for value in values {
                if let MetricValue::RasterStats(stats) = value {
                    match stats.bands.as_slice() {
                        [band] => bands.push(band.clone()),
                        [] => {}
                        _ => {
                            return Err(OverlayError::metrics(
                                "Multiple bands are not supported for raster_stats",
                            ))
                        }
                    }
                }
            }
            MetricValue::RasterStats(RasterStatsValue {
                bands: vec![combine_raster_band_stats(&bands)?],
            })
        }
        MetricValue::DistanceToShore(_) => {
            let closest = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::DistanceToShore(d) => Some(d),
                    _ => None,
                })
                .fold(None::<&DistanceToShoreValue>, |closest, d| match closest {
                    Some(c) if c.meters <= d.meters => Some(c),
                    _ => Some(d),
                });
            match closest {
                Some(d) => MetricValue::DistanceToShore(d.clone()),
                None => return Err(OverlayError::metrics("Cannot combine empty array of metrics")),
            }
        }
    })
}

/// Combine per-class values, by class key. A class missing from some
/// fragments is combined from the fragments that have it.
fn combine_grouped<T, F>(values: &[&BTreeMap<String, T>], combine: F) -> BTreeMap<String, T>
where
    T: Clone,
    F: Fn(&[T]) -> T,
{
    let mut by_key: BTreeMap<&str, Vec<T>> = BTreeMap::new();
    for grouped in values {
        for (key, value) in grouped.iter() {
            by_key.entry(key.as_str()).or_default().push(value.clone());
        }
    }
    by_key
        .into_iter()
        .map(|(key, group)| (key.to_string(), combine(&group)))
        .collect()
}

fn combine_column_stats_by_attribute(
    entries: &[BTreeMap<String, ColumnValueStats>],
) -> BTreeMap<String, ColumnValueStats> {
    let mut by_attr: BTreeMap<&str, Vec<&ColumnValueStats>> = BTreeMap::new();
    for entry in entries {
        for (attr, stats) in entry {
            by_attr.entry(attr.as_str()).or_default().push(stats);
        }
    }

    let mut combined = BTreeMap::new();
    for (attr, stats) in by_attr {
        let numbers: Vec<&NumberColumnValueStats> = stats
            .iter()
            .filter_map(|s| match s {
                ColumnValueStats::Number(n) => Some(n),
                _ => None,
            })
            .collect();

        let merged = if matches!(stats.first(), Some(ColumnValueStats::Number(_))) {
            combine_number_column_value_stats(&numbers).map(ColumnValueStats::Number)
        } else {
            combine_distinct_value_stats(&stats)
        };
        if let Some(merged) = merged {
            combined.insert(attr.to_string(), merged);
        }
    }
    combined
}

/// Combine numeric column statistics.
///
/// Mean and standard deviation are weighted by `total_area_sq_km` when any
/// input carries a positive area, otherwise by count.
pub fn combine_number_column_value_stats(
    stats: &[&NumberColumnValueStats],
) -> Option<NumberColumnValueStats> {
    match stats {
        [] => return None,
        [single] => return Some((*single).clone()),
        _ => {}
    }

    let use_area_weight = stats
        .iter()
        .any(|s| s.total_area_sq_km.map_or(false, |area| area > 0.0));

    let mut count = 0u64;
    let mut sum = 0.0;
    let mut min = f64::NAN;
    let mut max = f64::NAN;
    let mut total_weight = 0.0;
    let mut weighted_mean = 0.0;
    let mut weighted_second_moment = 0.0;
    let mut histogram: BTreeMap<u64, (f64, u64)> = BTreeMap::new();

    for s in stats {
        let weight = match (use_area_weight, s.total_area_sq_km) {
            (true, Some(area)) => area.max(0.0),
            _ => s.count as f64,
        };
        if !weight.is_finite() || weight <= 0.0 {
            continue;
        }

        count += s.count;
        sum += s.sum;
        min = nan_min(min, s.min);
        max = nan_max(max, s.max);

        if s.mean.is_finite() {
            weighted_mean += s.mean * weight;
            total_weight += weight;
            if s.std_dev.is_finite() {
                weighted_second_moment += (s.std_dev * s.std_dev + s.mean * s.mean) * weight;
            }
        }

        for &(value, n) in &s.histogram {
            histogram.entry(value.to_bits()).or_insert((value, 0)).1 += n;
        }
    }

    let (mean, std_dev) = if total_weight > 0.0 && weighted_mean != 0.0 {
        let mean = weighted_mean / total_weight;
        let std_dev = if weighted_second_moment != 0.0 {
            let variance = weighted_second_moment / total_weight - mean * mean;
            variance.max(0.0).sqrt()
        } else {
            f64::NAN
        };
        (mean, std_dev)
    } else if count > 0 {
        (sum / count as f64, f64::NAN)
    } else {
        (f64::NAN, f64::NAN)
    };

    let count_distinct = histogram.len() as u64;
    let mut histogram: Vec<(f64, u64)> = histogram.into_values().collect();
    histogram.sort_by(|a, b| a.0.total_cmp(&b.0));
    let histogram = downsample_histogram(histogram, MAX_HISTOGRAM_ENTRIES);

    let total_area_sq_km = use_area_weight.then(|| {
        stats
            .iter()
            .filter_map(|s| s.total_area_sq_km)
            .filter(|area| *area > 0.0)
            .sum()
    });

    Some(NumberColumnValueStats {
        count,
        min,
        max,
        mean,
        std_dev,
        histogram,
        count_distinct,
        sum,
        total_area_sq_km,
    })
}

fn combine_distinct_value_stats(stats: &[&ColumnValueStats]) -> Option<ColumnValueStats> {
    let distinct: Vec<&DistinctValueStats> = stats
        .iter()
        .filter_map(|s| match s {
            ColumnValueStats::String(d) | ColumnValueStats::Boolean(d) => Some(d),
            ColumnValueStats::Number(_) => None,
        })
        .collect();

    let is_boolean = matches!(stats.first(), Some(ColumnValueStats::Boolean(_)));
    let combined = match distinct.as_slice() {
        [] => return None,
        [single] => (*single).clone(),
        _ => {
            let mut values: Vec<(Value, u64)> = Vec::new();
            for d in &distinct {
                for (value, n) in &d.distinct_values {
                    match values.iter_mut().find(|(v, _)| v == value) {
                        Some(existing) => existing.1 += n,
                        None => values.push((value.clone(), *n)),
                    }
                }
            }
            DistinctValueStats {
                count_distinct: values.len() as u64,
                distinct_values: values,
            }
        }
    };

    Some(if is_boolean {
        ColumnValueStats::Boolean(combined)
    } else {
        ColumnValueStats::String(combined)
    })
}

/// Combine one band's statistics across fragments. The mean is recomputed
/// from the combined sum and count; the median cannot be and is NaN.
pub fn combine_raster_band_stats(stats: &[RasterBandStats]) -> Result<RasterBandStats> {
    match stats {
        [] => {
            return Err(OverlayError::metrics(
                "Cannot combine empty array of RasterBandStats",
            ))
        }
        [single] => return Ok(single.clone()),
        _ => {}
    }

    let mut count = 0;
    let mut sum = 0.0;
    let mut invalid = 0;
    let mut min = f64::NAN;
    let mut max = f64::NAN;
    let mut histogram: BTreeMap<u64, (f64, u64)> = BTreeMap::new();

    for s in stats {
        count += s.count;
        sum += s.sum;
        invalid += s.invalid;
        min = nan_min(min, s.min);
        max = nan_max(max, s.max);
        for &(value, n) in &s.histogram {
            histogram.entry(value.to_bits()).or_insert((value, 0)).1 += n;
        }
    }

    let mut histogram: Vec<(f64, u64)> = histogram.into_values().collect();
    histogram.sort_by(|a, b| a.0.total_cmp(&b.0));

    Ok(RasterBandStats {
        count,
        min,
        max,
        mean: if count > 0 { sum / count as f64 } else { f64::NAN },
        median: f64::NAN,
        range: max - min,
        histogram,
        invalid,
        sum,
    })
}

/// Reduce a `(value, count)` histogram to at most `max_entries` equal-width
/// bins spanning the full value range. Total count is preserved.
pub fn downsample_histogram(histogram: Vec<(f64, u64)>, max_entries: usize) -> Vec<(f64, u64)> {
    if histogram.len() <= max_entries || max_entries == 0 {
        return histogram;
    }

    let mut sorted = histogram;
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let min_value = sorted[0].0;
    let max_value = sorted[sorted.len() - 1].0;

    if !min_value.is_finite() || !max_value.is_finite() || min_value == max_value || max_entries == 1 {
        let total = sorted.iter().map(|(_, n)| n).sum();
        return vec![(min_value, total)];
    }

    let bins = max_entries;
    let span = max_value - min_value;
    let mut counts = vec![0u64; bins];
    for (value, n) in &sorted {
        let normalized = (value - min_value) / span;
        let bin = (normalized * (bins - 1) as f64).round().clamp(0.0, (bins - 1) as f64) as usize;
        counts[bin] += n;
    }

    counts
        .into_iter()
        .enumerate()
        .filter(|(_, n)| *n > 0)
        .map(|(i, n)| (min_value + span * i as f64 / (bins - 1) as f64, n))
        .collect()
}

fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.min(b)
    }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.max(b)
    }
}

// ============================================================================
// Subjects and dependency hashes
// ============================================================================

/// The geography present in every fragment metric.
///
/// Ids are checked in ascending order and the first one shared by all
/// fragments wins.
pub fn find_primary_geography_id(metrics: &[Metric]) -> Result<i64> {
    let mut found: BTreeMap<i64, usize> = BTreeMap::new();
    let mut fragments = 0;

    for metric in metrics {
        if let MetricSubject::Fragment { geographies, .. } = &metric.subject {
            fragments += 1;
            for id in geographies {
                *found.entry(*id).or_default() += 1;
            }
        }
    }

    found
        .into_iter()
        .find(|(_, count)| *count == fragments)
        .map(|(id, _)| id)
        .ok_or_else(|| OverlayError::metrics("No primary geography id found."))
}

/// Stable 8 character hash of a metric dependency description.
///
/// Object keys are sorted and a `hash` key is ignored. Arrays keep their
/// order unless every item is a string, in which case they are sorted.
pub fn hash_metric_dependency(dependency: &serde_json::Value) -> String {
    fnv1a(&stable_serialize(dependency))
}

fn stable_serialize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => {
            let mut items: Vec<&serde_json::Value> = items.iter().collect();
            if items.iter().all(|item| item.is_string()) {
                items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            }
            let parts: Vec<String> = items.into_iter().map(stable_serialize).collect();
            format!("[{}]", parts.join(","))
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| k.as_str() != "hash").collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", json_string(key), stable_serialize(&map[key.as_str()])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// 32-bit FNV-1a over UTF-16 code units, as lowercase hex.
fn fnv1a(input: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for unit in input.encode_utf16() {
        hash ^= u32::from(unit);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:08x}", hash)
}

/// Serializes NaN as `null` and reads `null` back as NaN.
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number_stats(count: u64, mean: f64, std_dev: f64, area: Option<f64>) -> NumberColumnValueStats {
        NumberColumnValueStats {
            count,
            min: mean - 1.0,
            max: mean + 1.0,
            mean,
            std_dev,
            histogram: vec![(mean, count)],
            count_distinct: 1,
            sum: mean * count as f64,
            total_area_sq_km: area,
        }
    }

    // ============================================================================
    // UniqueIdIndex tests
    // ============================================================================

    #[test]
    fn test_unique_id_index_from_ids() {
        assert_eq!(UniqueIdIndex::from_ids(vec![]), UniqueIdIndex::default());
        assert_eq!(
            UniqueIdIndex::from_ids(vec![1, 2, 3, 7, 10, 11, 12, 15]),
            UniqueIdIndex {
                ranges: vec![(1, 3), (10, 12)],
                individuals: vec![7, 15],
            }
        );
        assert_eq!(
            UniqueIdIndex::from_ids(vec![5, 1, 3, 2, 4, 4]),
            UniqueIdIndex {
                ranges: vec![(1, 5)],
                individuals: vec![],
            }
        );
    }

    #[test]
    fn test_unique_id_index_merge_and_count() {
        let a = UniqueIdIndex::from_ids(vec![1, 2, 3, 9]);
        let b = UniqueIdIndex::from_ids(vec![3, 4, 5, 20]);
        let merged = UniqueIdIndex::merge([&a, &b]);
        assert_eq!(merged.ranges, vec![(1, 5)]);
        assert_eq!(merged.individuals, vec![9, 20]);
        assert_eq!(merged.count(), 7);
    }

    // ============================================================================
    // Combination tests
    // ============================================================================

    #[test]
    fn test_combine_rejects_empty_and_mixed() {
        assert!(combine_metrics_for_fragments(&[]).is_err());

        let err = combine_metrics_for_fragments(&[
            MetricValue::TotalArea(1.0),
            MetricValue::Count(BTreeMap::new()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("same type"));
    }

    #[test]
    fn test_combine_areas() {
        let total = combine_metrics_for_fragments(&[
            MetricValue::TotalArea(1.5),
            MetricValue::TotalArea(2.5),
        ])
        .unwrap();
        assert_eq!(total, MetricValue::TotalArea(4.0));

        let a = BTreeMap::from([("*".to_string(), 1.0), ("A".to_string(), 1.0)]);
        let b = BTreeMap::from([("*".to_string(), 2.0), ("B".to_string(), 2.0)]);
        let combined =
            combine_metrics_for_fragments(&[MetricValue::OverlayArea(a), MetricValue::OverlayArea(b)])
                .unwrap();
        assert_eq!(
            combined,
            MetricValue::OverlayArea(BTreeMap::from([
                ("*".to_string(), 3.0),
                ("A".to_string(), 1.0),
                ("B".to_string(), 2.0),
            ]))
        );
    }

    #[test]
    fn test_combine_lengths() {
        let a = BTreeMap::from([("*".to_string(), 1.25)]);
        let b = BTreeMap::from([("*".to_string(), 0.75), ("cable".to_string(), 0.75)]);
        let combined = combine_metrics_for_fragments(&[
            MetricValue::OverlayLength(a),
            MetricValue::OverlayLength(b),
        ])
        .unwrap();
        assert_eq!(combined.type_name(), "overlay_length");
        assert_eq!(
            combined,
            MetricValue::OverlayLength(BTreeMap::from([
                ("*".to_string(), 2.0),
                ("cable".to_string(), 0.75),
            ]))
        );
    }

    #[test]
    fn test_combine_counts_deduplicates_ids() {
        let count = |ids: Vec<u64>| {
            let unique_id_index = UniqueIdIndex::from_ids(ids);
            MetricValue::Count(BTreeMap::from([(
                "*".to_string(),
                CountValue {
                    count: unique_id_index.count(),
                    unique_id_index,
                },
            )]))
        };

        let combined = combine_metrics_for_fragments(&[count(vec![1, 2, 3]), count(vec![3, 4])]).unwrap();
        match combined {
            MetricValue::Count(groups) => assert_eq!(groups["*"].count, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_combine_number_stats_weighted_by_count() {
        let a = number_stats(100, 5.0, f64::NAN, None);
        let b = number_stats(25, 20.0, f64::NAN, None);
        let combined = combine_number_column_value_stats(&[&a, &b]).unwrap();
        assert_eq!(combined.count, 125);
        assert!((combined.mean - 8.0).abs() < 1e-9);
        assert!(combined.std_dev.is_nan());
        assert_eq!(combined.min, 4.0);
        assert_eq!(combined.max, 21.0);
        assert_eq!(combined.count_distinct, 2);
        assert!(combined.total_area_sq_km.is_none());
    }

    #[test]
    fn test_combine_number_stats_weighted_by_area() {
        let a = number_stats(1, 10.0, 0.0, Some(3.0));
        let b = number_stats(1, 20.0, 0.0, Some(1.0));
        let combined = combine_number_column_value_stats(&[&a, &b]).unwrap();
        assert!((combined.mean - 12.5).abs() < 1e-9);
        // E[x^2] - mean^2 = (300 + 400) / 4 - 156.25
        assert!((combined.std_dev - 18.75f64.sqrt()).abs() < 1e-9);
        assert_eq!(combined.total_area_sq_km, Some(4.0));
    }

    #[test]
    fn test_combine_number_stats_with_zero_means() {
        let a = number_stats(4, 0.0, 0.0, Some(2.0));
        let b = number_stats(6, 0.0, 0.0, Some(1.0));
        let combined = combine_number_column_value_stats(&[&a, &b]).unwrap();
        assert_eq!(combined.mean, 0.0);
        assert_eq!(combined.sum, 0.0);
        assert_eq!(combined.count, 10);
        assert!(combined.std_dev.is_nan());
    }

    #[test]
    fn test_combine_distinct_values() {
        let stats = |pairs: &[(&str, u64)]| {
            ColumnValueStats::String(DistinctValueStats {
                distinct_values: pairs.iter().map(|(v, n)| (Value::from(*v), *n)).collect(),
                count_distinct: pairs.len() as u64,
            })
        };
        let a = BTreeMap::from([("*".to_string(), BTreeMap::from([("kind".to_string(), stats(&[("reef", 2)]))]))]);
        let b = BTreeMap::from([(
            "*".to_string(),
            BTreeMap::from([("kind".to_string(), stats(&[("reef", 1), ("kelp", 4)]))]),
        )]);

        let combined =
            combine_metrics_for_fragments(&[MetricValue::ColumnValues(a), MetricValue::ColumnValues(b)])
                .unwrap();
        let MetricValue::ColumnValues(groups) = combined else {
            panic!("expected column values");
        };
        assert_eq!(
            groups["*"]["kind"],
            stats(&[("reef", 3), ("kelp", 4)])
        );
    }

    #[test]
    fn test_combine_raster_stats() {
        let band = |count: u64, mean: f64| RasterBandStats {
            count,
            min: mean,
            max: mean,
            mean,
            median: mean,
            range: 0.0,
            histogram: vec![(mean, count)],
            invalid: 1,
            sum: mean * count as f64,
        };
        let combined = combine_metrics_for_fragments(&[
            MetricValue::RasterStats(RasterStatsValue { bands: vec![band(100, 5.0)] }),
            MetricValue::RasterStats(RasterStatsValue { bands: vec![band(25, 20.0)] }),
        ])
        .unwrap();
        let MetricValue::RasterStats(stats) = combined else {
            panic!("expected raster stats");
        };
        let band = &stats.bands[0];
        assert!((band.mean - 8.0).abs() < 1e-9);
        assert!(band.median.is_nan());
        assert_eq!(band.range, 15.0);
        assert_eq!(band.invalid, 2);

        let two_bands = MetricValue::RasterStats(RasterStatsValue {
            bands: vec![band.clone(), band.clone()],
        });
        assert!(combine_metrics_for_fragments(&[two_bands.clone(), two_bands]).is_err());
    }

    #[test]
    fn test_combine_presence_and_distance() {
        assert_eq!(
            combine_metrics_for_fragments(&[MetricValue::Presence(false), MetricValue::Presence(true)])
                .unwrap(),
            MetricValue::Presence(true)
        );

        let distance = |meters| {
            MetricValue::DistanceToShore(DistanceToShoreValue {
                meters,
                extra: serde_json::Map::new(),
            })
        };
        assert_eq!(
            combine_metrics_for_fragments(&[distance(300.0), distance(120.0), distance(500.0)]).unwrap(),
            distance(120.0)
        );
    }

    #[test]
    fn test_downsample_histogram_preserves_total() {
        let histogram: Vec<(f64, u64)> = (0..1000).map(|i| (i as f64, 1)).collect();
        let downsampled = downsample_histogram(histogram, MAX_HISTOGRAM_ENTRIES);
        assert!(downsampled.len() <= MAX_HISTOGRAM_ENTRIES);
        assert_eq!(downsampled.iter().map(|(_, n)| n).sum::<u64>(), 1000);
        assert_eq!(downsampled[0].0, 0.0);
        assert_eq!(downsampled[downsampled.len() - 1].0, 999.0);
    }

    // ============================================================================
    // Subject and hash tests
    // ============================================================================

    #[test]
    fn test_find_primary_geography_id() {
        let fragment = |geographies: Vec<i64>| Metric {
            subject: MetricSubject::Fragment {
                hash: "abc".to_string(),
                geographies,
                sketches: vec![1],
            },
            value: MetricValue::TotalArea(1.0),
            source_url: None,
            parameters: BTreeMap::new(),
        };

        let metrics = vec![fragment(vec![2, 7]), fragment(vec![7]), fragment(vec![7, 9])];
        assert_eq!(find_primary_geography_id(&metrics).unwrap(), 7);
        assert!(find_primary_geography_id(&[fragment(vec![1]), fragment(vec![2])]).is_err());
    }

    #[test]
    fn test_hash_metric_dependency_is_stable() {
        let a = json!({"type": "overlay_area", "geographies": ["b", "a"], "parameters": {"groupBy": "class", "bufferDistanceKm": 1.0}});
        let b = json!({"parameters": {"bufferDistanceKm": 1, "groupBy": "class"}, "geographies": ["a", "b"], "type": "overlay_area", "hash": "ignored"});
        let c = json!({"type": "overlay_area", "geographies": ["a", "b"], "parameters": {"groupBy": "other"}});

        let hash = hash_metric_dependency(&a);
        assert_eq!(hash.len(), 8);
        assert_eq!(hash, hash_metric_dependency(&b));
        assert_ne!(hash, hash_metric_dependency(&c));
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(""), "811c9dc5");
        assert_eq!(fnv1a("a"), "e40c292c");
    }

    #[test]
    fn test_metric_json_shape() {
        let metric = Metric {
            subject: MetricSubject::geography(12),
            value: MetricValue::OverlayArea(BTreeMap::from([("*".to_string(), 1.0)])),
            source_url: Some("https://example.com/habitats.fgb".to_string()),
            parameters: BTreeMap::from([("groupBy".to_string(), json!("class"))]),
        };

        let json = serde_json::to_value(&metric).unwrap();
        assert_eq!(
            json,
            json!({
                "subject": {"id": 12},
                "type": "overlay_area",
                "value": {"*": 1.0},
                "sourceUrl": "https://example.com/habitats.fgb",
                "parameters": {"groupBy": "class"}
            })
        );

        let parsed: Metric = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, metric);
    }

    #[test]
    fn test_nan_stats_serialize_as_null() {
        let stats = ColumnValueStats::Number(number_stats(0, f64::NAN, f64::NAN, None));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["type"], "number");
        assert!(json["mean"].is_null());
        assert!(json["stdDev"].is_null());
    }
}
