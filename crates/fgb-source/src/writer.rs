//! FlatGeobuf writer.
//!
//! Produces indexed files (Hilbert-sorted features plus a packed R-tree)
//! that [`FlatGeobufSource`](crate::FlatGeobufSource) can query by range.

use std::collections::BTreeMap;
use std::path::Path;

use flatbuffers::{FlatBufferBuilder, ForwardsUOffset, Vector, WIPOffset};
use flatgeobuf::{
    Column, ColumnArgs, ColumnType, Crs, CrsArgs, Feature as FbFeature, FeatureArgs,
    Geometry as FbGeometry, GeometryArgs, GeometryType, Header, HeaderArgs,
};
use geo::BoundingRect;
use geo_types::{Geometry, LineString, Polygon};
use tracing::debug;

use crate::error::{Result, SourceError};
use crate::format::rtree::{self, NodeItem};
use crate::format::MAGIC_BYTES;
use crate::format::Value;
use crate::types::Envelope;

/// Node size of written indexes.
pub const DEFAULT_NODE_SIZE: u16 = 16;

/// Storage type of a written column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Double,
    Long,
    Boolean,
}

impl ColumnKind {
    fn column_type(self) -> ColumnType {
        match self {
            ColumnKind::String => ColumnType::String,
            ColumnKind::Double => ColumnType::Double,
            ColumnKind::Long => ColumnType::Long,
            ColumnKind::Boolean => ColumnType::Bool,
        }
    }
}

/// A column to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

struct PendingFeature {
    geometry: Geometry<f64>,
    properties: BTreeMap<String, Value>,
    envelope: Envelope,
}

/// Buffers features in memory and serializes them as one FlatGeobuf file.
pub struct FgbWriter {
    name: String,
    geometry_type: GeometryType,
    columns: Vec<ColumnSpec>,
    features: Vec<PendingFeature>,
}

impl FgbWriter {
    /// Create a writer. Use `GeometryType::Unknown` for mixed geometry.
    pub fn new(name: impl Into<String>, geometry_type: GeometryType, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            geometry_type,
            columns,
            features: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Add a feature. Properties without a matching column are dropped.
    pub fn add_feature(&mut self, geometry: Geometry<f64>, properties: BTreeMap<String, Value>) {
        let envelope = geometry
            .bounding_rect()
            .map(Envelope::from)
            .unwrap_or_else(Envelope::empty);
        self.features.push(PendingFeature {
            geometry,
            properties,
            envelope,
        });
    }

    /// Serialize the file.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut extent = Envelope::empty();
        for feature in &self.features {
            if !feature.envelope.is_empty() {
                extent.expand(&feature.envelope);
            }
        }

        // Hilbert order keeps spatially close features close in the file
        let mut order: Vec<(u32, usize)> = self
            .features
            .iter()
            .enumerate()
            .map(|(i, f)| (rtree::hilbert_value(&f.envelope, &extent), i))
            .collect();
        order.sort();

        let mut feature_bytes = Vec::new();
        let mut leaves = Vec::with_capacity(self.features.len());
        for (_, i) in &order {
            let feature = &self.features[*i];
            leaves.push(NodeItem::new(feature.envelope, feature_bytes.len() as u64));
            feature_bytes.extend_from_slice(&self.encode_feature(feature)?);
        }

        let node_size = if self.features.is_empty() { 0 } else { DEFAULT_NODE_SIZE };
        let index = rtree::build(&leaves, DEFAULT_NODE_SIZE);
        let header = self.encode_header(&extent, node_size);

        let mut out = Vec::with_capacity(MAGIC_BYTES.len() + header.len() + index.len() + feature_bytes.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.extend_from_slice(&header);
        out.extend_from_slice(&index);
        out.extend_from_slice(&feature_bytes);

        debug!(
            name = %self.name,
            features = self.features.len(),
            bytes = out.len(),
            "Serialized FlatGeobuf"
        );
        Ok(out)
    }

    /// Serialize and write to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn encode_header(&self, extent: &Envelope, index_node_size: u16) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();

        let columns: Vec<WIPOffset<Column>> = self
            .columns
            .iter()
            .map(|spec| {
                let name = fbb.create_string(&spec.name);
                Column::create(
                    &mut fbb,
                    &ColumnArgs {
                        name: Some(name),
                        type_: spec.kind.column_type(),
                        nullable: true,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let columns = fbb.create_vector(&columns);

        let name = fbb.create_string(&self.name);
        let envelope = if extent.is_empty() {
            None
        } else {
            Some(fbb.create_vector(&[extent.min_x, extent.min_y, extent.max_x, extent.max_y]))
        };
        let crs = Crs::create(
            &mut fbb,
            &CrsArgs {
                code: 4326,
                ..Default::default()
            },
        );

        let header = Header::create(
            &mut fbb,
            &HeaderArgs {
                name: Some(name),
                envelope,
                geometry_type: self.geometry_type,
                columns: Some(columns),
                features_count: self.features.len() as u64,
                index_node_size,
                crs: Some(crs),
                ..Default::default()
            },
        );
        fbb.finish_size_prefixed(header, None);
        fbb.finished_data().to_vec()
    }

    fn encode_feature(&self, feature: &PendingFeature) -> Result<Vec<u8>> {
        let mut fbb = FlatBufferBuilder::new();
        let geometry = encode_geometry(&mut fbb, &feature.geometry, self.geometry_type)?;
        let properties = self.encode_properties(&feature.properties);
        let properties = fbb.create_vector(&properties);
        let root = FbFeature::create(
            &mut fbb,
            &FeatureArgs {
                geometry: Some(geometry),
                properties: Some(properties),
                ..Default::default()
            },
        );
        fbb.finish_size_prefixed(root, None);
        Ok(fbb.finished_data().to_vec())
    }

    fn encode_properties(&self, properties: &BTreeMap<String, Value>) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, column) in self.columns.iter().enumerate() {
            let value = match properties.get(&column.name) {
                Some(value) if !value.is_null() => value,
                _ => continue,
            };

            let encoded: Option<Vec<u8>> = match column.kind {
                ColumnKind::String => {
                    let s = value.to_string();
                    let mut buf = (s.len() as u32).to_le_bytes().to_vec();
                    buf.extend_from_slice(s.as_bytes());
                    Some(buf)
                }
                ColumnKind::Double => number_of(value).map(|n| n.to_le_bytes().to_vec()),
                ColumnKind::Long => number_of(value).map(|n| (n as i64).to_le_bytes().to_vec()),
                ColumnKind::Boolean => match value {
                    Value::Boolean(b) => Some(vec![*b as u8]),
                    Value::String(s) if s == "true" || s == "false" => Some(vec![(s == "true") as u8]),
                    _ => None,
                },
            };

            if let Some(encoded) = encoded {
                out.extend_from_slice(&(i as u16).to_le_bytes());
                out.extend_from_slice(&encoded);
            }
        }
        out
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.parse().ok(),
        Value::Null => None,
    }
}

fn ring_parts(polygon: &Polygon<f64>) -> (Vec<f64>, Vec<u32>) {
    let mut xy = Vec::new();
    let mut ends = Vec::new();
    for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
        push_coords(&mut xy, ring);
        ends.push((xy.len() / 2) as u32);
    }
    (xy, ends)
}

fn push_coords(xy: &mut Vec<f64>, line: &LineString<f64>) {
    for coord in line.coords() {
        xy.push(coord.x);
        xy.push(coord.y);
    }
}

fn simple_geometry<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    xy: &[f64],
    ends: Option<&[u32]>,
    type_: GeometryType,
) -> WIPOffset<FbGeometry<'a>> {
    let xy = fbb.create_vector(xy);
    let ends = ends.map(|ends| fbb.create_vector(ends));
    FbGeometry::create(
        fbb,
        &GeometryArgs {
            xy: Some(xy),
            ends,
            type_,
            ..Default::default()
        },
    )
}

fn encode_geometry<'a>(
    fbb: &mut FlatBufferBuilder<'a>,
    geometry: &Geometry<f64>,
    header_type: GeometryType,
) -> Result<WIPOffset<FbGeometry<'a>>> {
    let encoded = match geometry {
        Geometry::Point(point) => simple_geometry(fbb, &[point.x(), point.y()], None, GeometryType::Point),
        Geometry::MultiPoint(points) => {
            let xy: Vec<f64> = points.iter().flat_map(|p| [p.x(), p.y()]).collect();
            simple_geometry(fbb, &xy, None, GeometryType::MultiPoint)
        }
        Geometry::Line(line) => simple_geometry(
            fbb,
            &[line.start.x, line.start.y, line.end.x, line.end.y],
            None,
            GeometryType::LineString,
        ),
        Geometry::LineString(line) => {
            let mut xy = Vec::new();
            push_coords(&mut xy, line);
            simple_geometry(fbb, &xy, None, GeometryType::LineString)
        }
        Geometry::MultiLineString(lines) => {
            let mut xy = Vec::new();
            let mut ends = Vec::new();
            for line in lines {
                push_coords(&mut xy, line);
                ends.push((xy.len() / 2) as u32);
            }
            simple_geometry(fbb, &xy, Some(&ends), GeometryType::MultiLineString)
        }
        Geometry::Polygon(polygon) => {
            let (xy, ends) = ring_parts(polygon);
            simple_geometry(fbb, &xy, Some(&ends), GeometryType::Polygon)
        }
        Geometry::Rect(rect) => {
            let (xy, ends) = ring_parts(&rect.to_polygon());
            simple_geometry(fbb, &xy, Some(&ends), GeometryType::Polygon)
        }
        Geometry::Triangle(triangle) => {
            let (xy, ends) = ring_parts(&triangle.to_polygon());
            simple_geometry(fbb, &xy, Some(&ends), GeometryType::Polygon)
        }
        Geometry::MultiPolygon(polygons) => {
            let mut parts: Vec<WIPOffset<FbGeometry>> = Vec::with_capacity(polygons.0.len());
            for polygon in polygons {
                let (xy, ends) = ring_parts(polygon);
                parts.push(simple_geometry(fbb, &xy, Some(&ends), GeometryType::Polygon));
            }
            let parts: WIPOffset<Vector<ForwardsUOffset<FbGeometry>>> = fbb.create_vector(&parts);
            FbGeometry::create(
                fbb,
                &GeometryArgs {
                    parts: Some(parts),
                    type_: GeometryType::MultiPolygon,
                    ..Default::default()
                },
            )
        }
        Geometry::GeometryCollection(collection) => {
            if header_type != GeometryType::Unknown && header_type != GeometryType::GeometryCollection {
                return Err(SourceError::config(
                    "geometry collections require an Unknown or GeometryCollection layer",
                ));
            }
            let mut parts = Vec::with_capacity(collection.len());
            for member in collection.iter() {
                parts.push(encode_geometry(fbb, member, GeometryType::Unknown)?);
            }
            let parts = fbb.create_vector(&parts);
            FbGeometry::create(
                fbb,
                &GeometryArgs {
                    parts: Some(parts),
                    type_: GeometryType::GeometryCollection,
                    ..Default::default()
                },
            )
        }
    };
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HeaderMeta;
    use geo_types::polygon;

    #[test]
    fn test_header_round_trip() {
        let mut writer = FgbWriter::new(
            "zones",
            GeometryType::Polygon,
            vec![
                ColumnSpec::new("name", ColumnKind::String),
                ColumnSpec::new("depth", ColumnKind::Double),
            ],
        );
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)];
        writer.add_feature(Geometry::Polygon(square), BTreeMap::new());

        let bytes = writer.to_bytes().unwrap();
        assert_eq!(&bytes[..3], b"fgb");

        let header = HeaderMeta::parse("mem://zones", &bytes).unwrap();
        assert_eq!(header.name.as_deref(), Some("zones"));
        assert_eq!(header.features_count, 1);
        assert_eq!(header.index_node_size, DEFAULT_NODE_SIZE);
        assert_eq!(header.columns.len(), 2);
        assert_eq!(header.columns[0].name, "name");
        assert!(header.columns[1].is_numeric());
        assert_eq!(header.geometry_type_name(), "Polygon");
        assert_eq!(header.envelope, Some(Envelope::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_empty_writer_has_no_index() {
        let writer = FgbWriter::new("empty", GeometryType::Polygon, vec![]);
        let bytes = writer.to_bytes().unwrap();
        let header = HeaderMeta::parse("mem://empty", &bytes).unwrap();
        assert_eq!(header.features_count, 0);
        assert_eq!(header.index_node_size, 0);
        assert_eq!(bytes.len() as u64, header.index_offset());
    }

    #[test]
    fn test_encode_properties_skips_unknown_and_null() {
        let writer = FgbWriter::new(
            "t",
            GeometryType::Point,
            vec![
                ColumnSpec::new("a", ColumnKind::Long),
                ColumnSpec::new("b", ColumnKind::Boolean),
            ],
        );
        let mut props = BTreeMap::new();
        props.insert("a".to_string(), Value::Number(42.0));
        props.insert("b".to_string(), Value::Null);
        props.insert("c".to_string(), Value::from("ignored"));

        let encoded = writer.encode_properties(&props);
        let mut expected = 0u16.to_le_bytes().to_vec();
        expected.extend_from_slice(&42i64.to_le_bytes());
        assert_eq!(encoded, expected);
    }
}
