//! Working geometry and guarded boolean operations.

use std::panic::{catch_unwind, AssertUnwindSafe};

use fgb_source::Envelope;
use geo::{Area, BooleanOps, BoundingRect, ChamberlainDuquetteArea, HaversineLength, Intersects};
use geo_types::{
    Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon, Rect,
};

use crate::error::{OverlayError, Result};

/// Geometry of one feature in the working set, reduced to a single
/// dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkingGeometry {
    Polygonal(MultiPolygon<f64>),
    Lineal(MultiLineString<f64>),
    Punctal(MultiPoint<f64>),
}

impl WorkingGeometry {
    /// Convert a decoded geometry.
    ///
    /// Geometry collections keep only their highest dimension. Polygons are
    /// sanitized; non-finite coordinates are rejected.
    pub fn from_geometry(geometry: Geometry<f64>) -> Result<Self> {
        let mut parts = Parts::default();
        parts.collect(geometry);

        if !parts.polygons.is_empty() || (parts.lines.is_empty() && parts.points.is_empty()) {
            return Ok(Self::Polygonal(sanitize(MultiPolygon(parts.polygons))?));
        }

        if !parts.lines.is_empty() {
            for line in &parts.lines {
                check_finite(line.coords())?;
            }
            return Ok(Self::Lineal(MultiLineString(parts.lines)));
        }

        check_finite(parts.points.iter().map(|p| &p.0))?;
        Ok(Self::Punctal(MultiPoint(parts.points)))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Polygonal(mp) => mp.0.is_empty(),
            Self::Lineal(ml) => ml.0.iter().all(|l| l.0.len() < 2),
            Self::Punctal(mp) => mp.0.is_empty(),
        }
    }

    /// Bounding box, or `None` when empty.
    pub fn envelope(&self) -> Option<Envelope> {
        let rect = match self {
            Self::Polygonal(mp) => mp.bounding_rect(),
            Self::Lineal(ml) => ml.bounding_rect(),
            Self::Punctal(mp) => mp.bounding_rect(),
        };
        rect.map(Envelope::from)
    }

    /// Spherical area in square kilometers. Zero for lines and points.
    pub fn area_sq_km(&self) -> f64 {
        match self {
            Self::Polygonal(mp) => mp.chamberlain_duquette_unsigned_area() * 1e-6,
            _ => 0.0,
        }
    }

    /// Great-circle length in kilometers. Zero for polygons and points.
    pub fn length_km(&self) -> f64 {
        match self {
            Self::Lineal(ml) => ml.haversine_length() / 1000.0,
            _ => 0.0,
        }
    }

    pub fn dimension_name(&self) -> &'static str {
        match self {
            Self::Polygonal(_) => "polygonal",
            Self::Lineal(_) => "lineal",
            Self::Punctal(_) => "punctal",
        }
    }

    pub fn into_geometry(self) -> Geometry<f64> {
        match self {
            Self::Polygonal(mp) => Geometry::MultiPolygon(mp),
            Self::Lineal(ml) => Geometry::MultiLineString(ml),
            Self::Punctal(mp) => Geometry::MultiPoint(mp),
        }
    }

    /// Keep only the parts inside `mask`.
    pub fn intersect(&self, mask: &MultiPolygon<f64>) -> Result<Self> {
        Ok(match self {
            Self::Polygonal(mp) => Self::Polygonal(guarded("intersection", || mp.intersection(mask))?),
            Self::Lineal(ml) => Self::Lineal(guarded("line clip", || mask.clip(ml, false))?),
            Self::Punctal(points) => Self::Punctal(MultiPoint(
                points.0.iter().filter(|p| mask.intersects(*p)).copied().collect(),
            )),
        })
    }

    /// Remove the parts inside `mask`.
    pub fn subtract(&self, mask: &MultiPolygon<f64>) -> Result<Self> {
        Ok(match self {
            Self::Polygonal(mp) => Self::Polygonal(guarded("difference", || mp.difference(mask))?),
            Self::Lineal(ml) => Self::Lineal(guarded("line clip", || mask.clip(ml, true))?),
            Self::Punctal(points) => Self::Punctal(MultiPoint(
                points.0.iter().filter(|p| !mask.intersects(*p)).copied().collect(),
            )),
        })
    }
}

#[derive(Default)]
struct Parts {
    polygons: Vec<Polygon<f64>>,
    lines: Vec<LineString<f64>>,
    points: Vec<Point<f64>>,
}

impl Parts {
    fn collect(&mut self, geometry: Geometry<f64>) {
        match geometry {
            Geometry::Point(p) => self.points.push(p),
            Geometry::MultiPoint(mp) => self.points.extend(mp.0),
            Geometry::Line(line) => self.lines.push(LineString::from(line)),
            Geometry::LineString(ls) => self.lines.push(ls),
            Geometry::MultiLineString(ml) => self.lines.extend(ml.0),
            Geometry::Polygon(p) => self.polygons.push(p),
            Geometry::MultiPolygon(mp) => self.polygons.extend(mp.0),
            Geometry::Rect(r) => self.polygons.push(r.to_polygon()),
            Geometry::Triangle(t) => self.polygons.push(t.to_polygon()),
            Geometry::GeometryCollection(gc) => {
                for g in gc.0 {
                    self.collect(g);
                }
            }
        }
    }
}

/// Polygonal parts of a clipping feature.
///
/// Lines and points cannot be used to clip, so any geometry that is not
/// (a collection of) polygons is rejected.
pub fn clipping_polygons(geometry: Geometry<f64>) -> Result<Vec<Polygon<f64>>> {
    let mut parts = Parts::default();
    parts.collect(geometry);
    if !parts.lines.is_empty() || !parts.points.is_empty() {
        return Err(OverlayError::geometry(
            "clipping layer features must be polygons or multipolygons",
        ));
    }
    Ok(parts.polygons)
}

/// Clean polygons before boolean operations.
///
/// Repeated consecutive coordinates are removed and rings are closed.
/// Rings with fewer than four coordinates are dropped, and a polygon whose
/// exterior is dropped is removed entirely. Each remaining polygon is then
/// resolved through a boolean operation, so self-intersecting rings become
/// simple parts with their real area. Parts that resolve to no area are
/// dropped.
pub fn sanitize(multi: MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
    let mut out = Vec::with_capacity(multi.0.len());

    for polygon in multi.0 {
        let (exterior, interiors) = polygon.into_inner();
        let exterior = match clean_ring(exterior)? {
            Some(ring) => ring,
            None => continue,
        };
        let mut holes = Vec::with_capacity(interiors.len());
        for ring in interiors {
            if let Some(ring) = clean_ring(ring)? {
                holes.push(ring);
            }
        }
        out.extend(resolve(Polygon::new(exterior, holes))?);
    }

    Ok(MultiPolygon(out))
}

fn clean_ring(ring: LineString<f64>) -> Result<Option<LineString<f64>>> {
    check_finite(ring.coords())?;

    let mut coords: Vec<Coord<f64>> = ring.0;
    coords.dedup();
    if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
        if first != last {
            coords.push(first);
        }
    }
    if coords.len() < 4 {
        return Ok(None);
    }
    Ok(Some(LineString(coords)))
}

/// Intersect a polygon with a frame around its bounding box.
///
/// Self-intersecting rings come back split at their crossings.
fn resolve(polygon: Polygon<f64>) -> Result<Vec<Polygon<f64>>> {
    let rect = match polygon.bounding_rect() {
        Some(rect) if rect.width() > 0.0 && rect.height() > 0.0 => rect,
        _ => return Ok(Vec::new()),
    };
    let margin = rect.width().max(rect.height());
    let frame = Rect::new(
        Coord { x: rect.min().x - margin, y: rect.min().y - margin },
        Coord { x: rect.max().x + margin, y: rect.max().y + margin },
    )
    .to_polygon();

    let subject = MultiPolygon(vec![polygon]);
    let frame = MultiPolygon(vec![frame]);
    let resolved = guarded("sanitize", || subject.intersection(&frame))?;
    Ok(resolved.0.into_iter().filter(|p| p.unsigned_area() > 0.0).collect())
}

fn check_finite<'a>(coords: impl IntoIterator<Item = &'a Coord<f64>>) -> Result<()> {
    for c in coords {
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err(OverlayError::geometry(format!(
                "non-finite coordinate ({}, {})",
                c.x, c.y
            )));
        }
    }
    Ok(())
}

/// Union polygons by balanced pairwise reduction.
///
/// Merging neighbours level by level keeps the intermediate results small
/// compared to folding every polygon into one growing accumulator.
pub fn union_all(polygons: Vec<Polygon<f64>>) -> Result<MultiPolygon<f64>> {
    let mut level: Vec<MultiPolygon<f64>> = polygons
        .into_iter()
        .map(|p| MultiPolygon(vec![p]))
        .collect();

    if level.is_empty() {
        return Ok(MultiPolygon(vec![]));
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(guarded("union", || a.union(&b))?),
                None => next.push(a),
            }
        }
        level = next;
    }

    Ok(level.pop().unwrap_or_else(|| MultiPolygon(vec![])))
}

/// Run a `geo` boolean operation, turning a panic into a geometry error.
fn guarded<T>(operation: &str, f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        OverlayError::geometry(format!("{} failed: {}", operation, detail))
    })
}
