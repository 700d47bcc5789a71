//! Feature decoding.

use std::collections::BTreeMap;

use flatgeobuf::{size_prefixed_root_as_feature, ColumnType, GeometryType};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde::{Deserialize, Serialize};

use super::header::{ColumnMeta, HeaderMeta};
use crate::error::{Result, SourceError};
use crate::types::Envelope;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Number(f64),
    String(String),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert from JSON. Arrays and objects have no attribute equivalent
    /// and become their serialized string.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

/// Renders numbers the way JSON does, so `8325.0` becomes `"8325"`.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => f.write_str("null"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// A feature read from a FlatGeobuf source.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Byte offset of the feature relative to the start of feature data.
    /// Unique within one source.
    pub id: u64,
    pub geometry: Geometry<f64>,
    pub properties: BTreeMap<String, Value>,
    /// Bounding box recorded in the spatial index.
    pub envelope: Envelope,
}

impl Feature {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Decode a size-prefixed feature buffer.
    pub fn parse(
        url: &str,
        data: &[u8],
        header: &HeaderMeta,
        id: u64,
        envelope: Envelope,
    ) -> Result<Self> {
        let feature = size_prefixed_root_as_feature(data)
            .map_err(|e| SourceError::format(url, format!("invalid feature at {}: {}", id, e)))?;

        let geometry = match feature.geometry() {
            Some(geometry) => decode_geometry(url, &geometry, header.geometry_type)?,
            None => Geometry::GeometryCollection(GeometryCollection::default()),
        };

        let properties = match feature.properties() {
            Some(bytes) => decode_properties(url, bytes.bytes(), &header.columns)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            id,
            geometry,
            properties,
            envelope,
        })
    }
}

fn coords(xy: &[f64]) -> Vec<Coord<f64>> {
    xy.chunks_exact(2)
        .map(|pair| Coord {
            x: pair[0],
            y: pair[1],
        })
        .collect()
}

/// Split a flat coordinate list into parts using `ends` (exclusive end
/// indexes counted in coordinates).
fn split_parts(coords: Vec<Coord<f64>>, ends: Option<Vec<u32>>) -> Vec<Vec<Coord<f64>>> {
    match ends {
        Some(ends) if ends.len() > 1 => {
            let mut parts = Vec::with_capacity(ends.len());
            let mut start = 0usize;
            for end in ends {
                let end = (end as usize).min(coords.len());
                if end > start {
                    parts.push(coords[start..end].to_vec());
                }
                start = end;
            }
            parts
        }
        _ => vec![coords],
    }
}

fn polygon_from_rings(mut rings: Vec<Vec<Coord<f64>>>) -> Polygon<f64> {
    if rings.is_empty() {
        return Polygon::new(LineString::new(vec![]), vec![]);
    }
    let exterior = LineString::new(rings.remove(0));
    let interiors = rings.into_iter().map(LineString::new).collect();
    Polygon::new(exterior, interiors)
}

fn decode_geometry(
    url: &str,
    geometry: &flatgeobuf::Geometry,
    header_type: GeometryType,
) -> Result<Geometry<f64>> {
    let geometry_type = if header_type == GeometryType::Unknown {
        geometry.type_()
    } else {
        header_type
    };

    let xy: Vec<f64> = geometry.xy().map(|v| v.iter().collect()).unwrap_or_default();
    let ends: Option<Vec<u32>> = geometry.ends().map(|v| v.iter().collect());
    let points = coords(&xy);

    let decoded = match geometry_type {
        GeometryType::Point => match points.first() {
            Some(coord) => Geometry::Point(Point::from(*coord)),
            None => Geometry::MultiPoint(MultiPoint::new(vec![])),
        },
        GeometryType::MultiPoint => {
            Geometry::MultiPoint(MultiPoint::new(points.into_iter().map(Point::from).collect()))
        }
        GeometryType::LineString => Geometry::LineString(LineString::new(points)),
        GeometryType::MultiLineString => Geometry::MultiLineString(MultiLineString::new(
            split_parts(points, ends)
                .into_iter()
                .map(LineString::new)
                .collect(),
        )),
        GeometryType::Polygon => Geometry::Polygon(polygon_from_rings(split_parts(points, ends))),
        GeometryType::MultiPolygon => {
            let mut polygons = Vec::new();
            match geometry.parts() {
                Some(parts) => {
                    for part in parts.iter() {
                        match decode_geometry(url, &part, GeometryType::Polygon)? {
                            Geometry::Polygon(polygon) => polygons.push(polygon),
                            _ => {
                                return Err(SourceError::format(url, "multipolygon part is not a polygon"))
                            }
                        }
                    }
                }
                // Single-part multipolygons may be written without parts
                None => polygons.push(polygon_from_rings(split_parts(points, ends))),
            }
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
        GeometryType::GeometryCollection => {
            let mut members = Vec::new();
            if let Some(parts) = geometry.parts() {
                for part in parts.iter() {
                    members.push(decode_geometry(url, &part, GeometryType::Unknown)?);
                }
            }
            Geometry::GeometryCollection(GeometryCollection::new_from(members))
        }
        other => {
            return Err(SourceError::format(
                url,
                format!("unsupported geometry type {:?}", other),
            ))
        }
    };

    Ok(decoded)
}

struct Cursor<'a> {
    url: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(SourceError::format(self.url, "truncated property data"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn remaining(&self) -> bool {
        self.pos < self.data.len()
    }
}

fn decode_properties(
    url: &str,
    data: &[u8],
    columns: &[ColumnMeta],
) -> Result<BTreeMap<String, Value>> {
    let mut properties = BTreeMap::new();
    let mut cursor = Cursor { url, data, pos: 0 };

    while cursor.remaining() {
        let column_index = u16::from_le_bytes(cursor.array::<2>()?) as usize;
        let column = columns.get(column_index).ok_or_else(|| {
            SourceError::format(url, format!("property references unknown column {}", column_index))
        })?;

        let value = match column.column_type {
            ColumnType::Byte => Value::Number(i8::from_le_bytes(cursor.array::<1>()?) as f64),
            ColumnType::UByte => Value::Number(cursor.array::<1>()?[0] as f64),
            ColumnType::Bool => Value::Boolean(cursor.array::<1>()?[0] != 0),
            ColumnType::Short => Value::Number(i16::from_le_bytes(cursor.array::<2>()?) as f64),
            ColumnType::UShort => Value::Number(u16::from_le_bytes(cursor.array::<2>()?) as f64),
            ColumnType::Int => Value::Number(i32::from_le_bytes(cursor.array::<4>()?) as f64),
            ColumnType::UInt => Value::Number(u32::from_le_bytes(cursor.array::<4>()?) as f64),
            ColumnType::Long => Value::Number(i64::from_le_bytes(cursor.array::<8>()?) as f64),
            ColumnType::ULong => Value::Number(u64::from_le_bytes(cursor.array::<8>()?) as f64),
            ColumnType::Float => Value::Number(f32::from_le_bytes(cursor.array::<4>()?) as f64),
            ColumnType::Double => Value::Number(f64::from_le_bytes(cursor.array::<8>()?)),
            ColumnType::String | ColumnType::Json | ColumnType::DateTime => {
                let len = u32::from_le_bytes(cursor.array::<4>()?) as usize;
                let bytes = cursor.take(len)?;
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            ColumnType::Binary => {
                let len = u32::from_le_bytes(cursor.array::<4>()?) as usize;
                cursor.take(len)?;
                continue;
            }
            other => {
                return Err(SourceError::format(
                    url,
                    format!("unsupported column type {:?} for {}", other, column.name),
                ))
            }
        };

        properties.insert(column.name.clone(), value);
    }

    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, column_type: ColumnType) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            column_type,
        }
    }

    #[test]
    fn test_decode_properties() {
        let columns = vec![
            column("name", ColumnType::String),
            column("count", ColumnType::Int),
            column("flag", ColumnType::Bool),
            column("area", ColumnType::Double),
            column("blob", ColumnType::Binary),
        ];

        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"EEZ");
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&(-7i32).to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0xAA, 0xBB]);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.push(1);
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&1.5f64.to_le_bytes());

        let props = decode_properties("mem://x", &data, &columns).unwrap();
        assert_eq!(props.get("name"), Some(&Value::String("EEZ".to_string())));
        assert_eq!(props.get("count"), Some(&Value::Number(-7.0)));
        assert_eq!(props.get("flag"), Some(&Value::Boolean(true)));
        assert_eq!(props.get("area"), Some(&Value::Number(1.5)));
        assert!(!props.contains_key("blob"));
    }

    #[test]
    fn test_decode_properties_errors() {
        let columns = vec![column("count", ColumnType::Int)];

        // Unknown column index
        let data = 5u16.to_le_bytes();
        assert!(decode_properties("mem://x", &data, &columns).is_err());

        // Truncated value
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes());
        data.push(1);
        assert!(decode_properties("mem://x", &data, &columns).is_err());
    }

    #[test]
    fn test_split_parts() {
        let pts = coords(&[0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 5.0, 5.0, 6.0, 5.0]);
        let parts = split_parts(pts.clone(), Some(vec![3, 5]));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 2);

        assert_eq!(split_parts(pts.clone(), None).len(), 1);
        assert_eq!(split_parts(pts, Some(vec![5])).len(), 1);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Number(8325.0).to_string(), "8325");
        assert_eq!(Value::Number(-0.5).to_string(), "-0.5");
        assert_eq!(Value::Boolean(false).to_string(), "false");
        assert_eq!(Value::from("A").to_string(), "A");
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from_json(&serde_json::json!(8325)), Value::Number(8325.0));
        assert_eq!(Value::from_json(&serde_json::json!("a")), Value::from("a"));
        assert_eq!(Value::from_json(&serde_json::json!(true)), Value::Boolean(true));
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
    }
}
