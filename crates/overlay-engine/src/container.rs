//! Containment of working features in a clipping mask.
//!
//! Most features of a typical overlay lie entirely inside or entirely
//! outside the mask. Classifying them first lets the clipper run boolean
//! operations only on features that cross the mask boundary.

use fgb_source::format::PackedRTree;
use fgb_source::Envelope;
use geo::{BoundingRect, Intersects};
use geo_types::{Coord, Line, LineString, MultiPolygon, Point, Polygon};

use crate::geometry::WorkingGeometry;

/// Node size of the boundary segment index.
const SEGMENT_NODE_SIZE: u16 = 16;

/// Where a feature lies relative to the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// Entirely covered by the mask.
    Inside,
    /// No part in common with the mask.
    Outside,
    /// Crosses or touches the mask boundary, or is only partly covered.
    Mixed,
}

/// Mask boundary segments with a packed R-tree over their envelopes.
pub struct ContainerIndex<'a> {
    mask: &'a MultiPolygon<f64>,
    envelope: Option<Envelope>,
    segments: Vec<Line<f64>>,
    tree: PackedRTree,
}

impl<'a> ContainerIndex<'a> {
    pub fn new(mask: &'a MultiPolygon<f64>) -> Self {
        let segments: Vec<Line<f64>> = mask
            .iter()
            .flat_map(|polygon| rings(polygon))
            .flat_map(|ring| ring.lines())
            .collect();
        let envelopes: Vec<Envelope> = segments.iter().map(segment_envelope).collect();

        Self {
            mask,
            envelope: mask.bounding_rect().map(Envelope::from),
            tree: PackedRTree::from_envelopes(&envelopes, SEGMENT_NODE_SIZE),
            segments,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Classify `geometry`, whose bounding box is `envelope`.
    ///
    /// The result is exact: `Inside` and `Outside` are only returned when
    /// the boolean operation would leave the geometry unchanged or empty.
    pub fn classify(&self, geometry: &WorkingGeometry, envelope: &Envelope) -> Containment {
        match self.envelope {
            Some(mask_envelope) if mask_envelope.intersects(envelope) => {}
            _ => return Containment::Outside,
        }

        match geometry {
            WorkingGeometry::Punctal(points) => {
                let inside = points.iter().filter(|p| self.mask.intersects(*p)).count();
                match inside {
                    0 => Containment::Outside,
                    n if n == points.0.len() => Containment::Inside,
                    _ => Containment::Mixed,
                }
            }
            WorkingGeometry::Lineal(lines) => {
                if lines
                    .iter()
                    .flat_map(|line| line.lines())
                    .any(|segment| self.touches_boundary(&segment))
                {
                    return Containment::Mixed;
                }
                self.vertices_state(lines.iter().filter_map(|line| line.0.first()))
            }
            WorkingGeometry::Polygonal(polygons) => {
                if polygons
                    .iter()
                    .flat_map(|polygon| rings(polygon))
                    .flat_map(|ring| ring.lines())
                    .any(|segment| self.touches_boundary(&segment))
                {
                    return Containment::Mixed;
                }

                let state = self.vertices_state(polygons.iter().filter_map(|p| p.exterior().0.first()));
                // A mask ring inside the feature: the mask sits in the feature,
                // or one of its holes does
                let holds_mask_ring = self
                    .mask
                    .iter()
                    .flat_map(|polygon| rings(polygon))
                    .filter_map(|ring| ring.0.first())
                    .any(|c| polygons.intersects(&Point::from(*c)));
                if holds_mask_ring {
                    Containment::Mixed
                } else {
                    state
                }
            }
        }
    }

    fn touches_boundary(&self, segment: &Line<f64>) -> bool {
        self.tree
            .search(&segment_envelope(segment))
            .iter()
            .any(|hit| self.segments.get(hit.index).map_or(false, |s| s.intersects(segment)))
    }

    /// State of components that do not touch the boundary, one vertex each.
    fn vertices_state<'c>(&self, vertices: impl Iterator<Item = &'c Coord<f64>>) -> Containment {
        let (mut inside, mut outside) = (false, false);
        for vertex in vertices {
            if self.mask.intersects(&Point::from(*vertex)) {
                inside = true;
            } else {
                outside = true;
            }
        }
        match (inside, outside) {
            (true, false) => Containment::Inside,
            (false, _) => Containment::Outside,
            (true, true) => Containment::Mixed,
        }
    }
}

fn rings(polygon: &Polygon<f64>) -> impl Iterator<Item = &LineString<f64>> {
    std::iter::once(polygon.exterior()).chain(polygon.interiors())
}

fn segment_envelope(segment: &Line<f64>) -> Envelope {
    let mut envelope = Envelope::empty();
    envelope.expand_point(segment.start.x, segment.start.y);
    envelope.expand_point(segment.end.x, segment.end.y);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{line_string, point, polygon, MultiLineString, MultiPoint, Rect};

    fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
        Rect::new(Coord { x, y }, Coord { x: x + size, y: y + size }).to_polygon()
    }

    fn polygonal(polygons: Vec<Polygon<f64>>) -> WorkingGeometry {
        WorkingGeometry::Polygonal(MultiPolygon(polygons))
    }

    fn classify(mask: &MultiPolygon<f64>, geometry: WorkingGeometry) -> Containment {
        let envelope = geometry.envelope().unwrap();
        ContainerIndex::new(mask).classify(&geometry, &envelope)
    }

    #[test]
    fn test_polygon_states() {
        let mask = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);

        assert_eq!(classify(&mask, polygonal(vec![square(2.0, 2.0, 1.0)])), Containment::Inside);
        assert_eq!(classify(&mask, polygonal(vec![square(20.0, 2.0, 1.0)])), Containment::Outside);
        assert_eq!(classify(&mask, polygonal(vec![square(9.0, 2.0, 2.0)])), Containment::Mixed);
        // Sharing an edge counts as touching
        assert_eq!(classify(&mask, polygonal(vec![square(10.0, 2.0, 1.0)])), Containment::Mixed);
        // Bounding boxes overlap but the shapes do not
        let l_mask = MultiPolygon(vec![geo_types::polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 1.0),
            (x: 1.0, y: 1.0), (x: 1.0, y: 4.0), (x: 0.0, y: 4.0),
        ]]);
        assert_eq!(classify(&l_mask, polygonal(vec![square(2.0, 2.0, 1.0)])), Containment::Outside);
    }

    #[test]
    fn test_parts_on_both_sides_are_mixed() {
        let mask = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);
        let parts = polygonal(vec![square(2.0, 2.0, 1.0), square(20.0, 2.0, 1.0)]);
        assert_eq!(classify(&mask, parts), Containment::Mixed);
    }

    #[test]
    fn test_feature_around_mask_is_mixed() {
        let mask = MultiPolygon(vec![square(4.0, 4.0, 1.0)]);
        assert_eq!(classify(&mask, polygonal(vec![square(0.0, 0.0, 10.0)])), Containment::Mixed);
    }

    #[test]
    fn test_feature_over_mask_hole_is_mixed() {
        let outer = square(0.0, 0.0, 10.0);
        let hole = square(4.0, 4.0, 1.0);
        let mask = MultiPolygon(vec![Polygon::new(outer.exterior().clone(), vec![hole.exterior().clone()])]);

        assert_eq!(classify(&mask, polygonal(vec![square(3.0, 3.0, 3.0)])), Containment::Mixed);
        assert_eq!(classify(&mask, polygonal(vec![square(1.0, 1.0, 1.0)])), Containment::Inside);
        // Inside the hole
        assert_eq!(classify(&mask, polygonal(vec![square(4.25, 4.25, 0.5)])), Containment::Outside);
    }

    #[test]
    fn test_line_and_point_states() {
        let mask = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);
        let inside = WorkingGeometry::Lineal(MultiLineString(vec![line_string![
            (x: 1.0, y: 1.0),
            (x: 5.0, y: 5.0),
        ]]));
        let crossing = WorkingGeometry::Lineal(MultiLineString(vec![line_string![
            (x: 5.0, y: 5.0),
            (x: 15.0, y: 5.0),
        ]]));
        assert_eq!(classify(&mask, inside), Containment::Inside);
        assert_eq!(classify(&mask, crossing), Containment::Mixed);

        let points = |pts: Vec<Point<f64>>| WorkingGeometry::Punctal(MultiPoint(pts));
        assert_eq!(classify(&mask, points(vec![point!(x: 1.0, y: 1.0)])), Containment::Inside);
        assert_eq!(
            classify(&mask, points(vec![point!(x: 1.0, y: 1.0), point!(x: 11.0, y: 1.0)])),
            Containment::Mixed
        );
    }

    #[test]
    fn test_empty_mask_is_outside() {
        let mask = MultiPolygon(vec![]);
        let index = ContainerIndex::new(&mask);
        assert_eq!(index.segment_count(), 0);
        assert_eq!(classify(&mask, polygonal(vec![square(0.0, 0.0, 1.0)])), Containment::Outside);
    }
}
