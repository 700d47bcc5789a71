//! Geometry generators with predictable areas and lengths.

use geo_types::{coord, LineString, MultiPolygon, Polygon, Rect};

use crate::fixtures::KM_SQUARE_DEGREES;

/// Axis-aligned square with its lower-left corner at `(x, y)`.
pub fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
    Rect::new(coord! { x: x, y: y }, coord! { x: x + size, y: y + size }).to_polygon()
}

/// Axis-aligned rectangle from its corners.
pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
    Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y }).to_polygon()
}

/// Self-intersecting ring through the corners of a square of side `size`,
/// crossing at its centre. The two lobes have half the square's area.
pub fn bowtie(x: f64, y: f64, size: f64) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (x, y),
            (x + size, y + size),
            (x + size, y),
            (x, y + size),
            (x, y),
        ]),
        vec![],
    )
}

/// Square of approximately 1 km² when `y` is near the equator.
pub fn km_square(x: f64, y: f64) -> Polygon<f64> {
    square(x, y, KM_SQUARE_DEGREES)
}

/// `columns * rows` squares of side `size`, row by row starting at the
/// origin. Adjacent squares share edges.
///
/// # Example
///
/// ```
/// use test_utils::square_grid;
///
/// let grid = square_grid(3, 2, 1.0);
/// assert_eq!(grid.len(), 6);
/// ```
pub fn square_grid(columns: usize, rows: usize, size: f64) -> Vec<Polygon<f64>> {
    let mut squares = Vec::with_capacity(columns * rows);
    for row in 0..rows {
        for col in 0..columns {
            squares.push(square(col as f64 * size, row as f64 * size, size));
        }
    }
    squares
}

/// Square of side `outer` with a centred square hole of side `inner`.
pub fn square_with_hole(x: f64, y: f64, outer: f64, inner: f64) -> Polygon<f64> {
    let offset = (outer - inner) / 2.0;
    let hole = square(x + offset, y + offset, inner);
    Polygon::new(square(x, y, outer).exterior().clone(), vec![hole.exterior().clone()])
}

/// Two disjoint squares of side `size`, separated by a gap of `size`.
pub fn two_squares(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![square(x, y, size), square(x + 2.0 * size, y, size)])
}

/// Straight line along the equator from `from_lon` to `to_lon`.
pub fn equator_line(from_lon: f64, to_lon: f64) -> LineString<f64> {
    LineString::from(vec![(from_lon, 0.0), (to_lon, 0.0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_grid_layout() {
        let grid = square_grid(3, 2, 2.0);
        assert_eq!(grid.len(), 6);
        assert!(grid[5].exterior().0.contains(&coord! { x: 4.0, y: 2.0 }));
        assert!(grid[5].exterior().0.contains(&coord! { x: 6.0, y: 4.0 }));
    }

    #[test]
    fn test_square_with_hole() {
        let polygon = square_with_hole(0.0, 0.0, 4.0, 2.0);
        assert_eq!(polygon.interiors().len(), 1);
        assert!(polygon.interiors()[0].0.contains(&coord! { x: 1.0, y: 1.0 }));
        assert!(polygon.interiors()[0].0.contains(&coord! { x: 3.0, y: 3.0 }));
    }

    #[test]
    fn test_two_squares_disjoint() {
        let multi = two_squares(0.0, 0.0, 1.0);
        assert_eq!(multi.0.len(), 2);
        assert!(multi.0[1].exterior().0.contains(&coord! { x: 2.0, y: 0.0 }));
    }

    #[test]
    fn test_bowtie_ring_crosses_itself() {
        use geo::{Area, Intersects};
        use geo_types::Line;

        let ring = bowtie(0.0, 0.0, 2.0).exterior().clone();
        assert_eq!(ring.0.len(), 5);
        assert_eq!(Polygon::new(ring.clone(), vec![]).unsigned_area(), 0.0);
        let first = Line::new(ring.0[0], ring.0[1]);
        let third = Line::new(ring.0[2], ring.0[3]);
        assert!(first.intersects(&third));
    }

    #[test]
    fn test_equator_line() {
        let line = equator_line(0.0, 1.0);
        assert_eq!(line.0.len(), 2);
    }
}
