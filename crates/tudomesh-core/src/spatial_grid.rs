//! A uniform-grid nearest-neighbour index over a target point cloud.
//!
//! Keyed at the correspondence rejection distance rather than built as a
//! k-d tree — simpler, and plenty fast for the point counts ICP deals with
//! here (a few thousand per map).

use std::collections::HashMap;

use crate::geometry::Point;

pub struct UniformGrid {
    cell_size: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
    points: Vec<Point>,
}

impl UniformGrid {
    pub fn build(points: &[Point], cell_size: f64) -> Self {
        let cell_size = cell_size.max(1e-6);
        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (idx, p) in points.iter().enumerate() {
            cells.entry(cell_key(*p, cell_size)).or_default().push(idx);
        }
        Self {
            cell_size,
            cells,
            points: points.to_vec(),
        }
    }

    /// Returns the nearest point to `query` within `max_distance`, or
    /// `None` if no point in the index is that close.
    pub fn nearest_within(&self, query: Point, max_distance: f64) -> Option<Point> {
        if self.points.is_empty() {
            return None;
        }
        let (qx, qy) = cell_key(query, self.cell_size);
        let ring = (max_distance / self.cell_size).ceil() as i64 + 1;

        let mut best: Option<(f64, Point)> = None;
        for dx in -ring..=ring {
            for dy in -ring..=ring {
                if let Some(indices) = self.cells.get(&(qx + dx, qy + dy)) {
                    for &idx in indices {
                        let candidate = self.points[idx];
                        let dist = (candidate - query).norm();
                        if dist <= max_distance && best.map(|(d, _)| dist < d).unwrap_or(true) {
                            best = Some((dist, candidate));
                        }
                    }
                }
            }
        }
        best.map(|(_, p)| p)
    }
}

fn cell_key(p: Point, cell_size: f64) -> (i64, i64) {
    ((p.x / cell_size).floor() as i64, (p.y / cell_size).floor() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nearest_point_in_range() {
        let points = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)];
        let grid = UniformGrid::build(&points, 5.0);
        let found = grid.nearest_within(Point::new(1.0, 1.0), 50.0).unwrap();
        assert_eq!(found, points[0]);
    }

    #[test]
    fn rejects_points_outside_max_distance() {
        let points = vec![Point::new(100.0, 100.0)];
        let grid = UniformGrid::build(&points, 5.0);
        assert!(grid.nearest_within(Point::new(0.0, 0.0), 10.0).is_none());
    }

    #[test]
    fn empty_index_returns_none() {
        let grid = UniformGrid::build(&[], 5.0);
        assert!(grid.nearest_within(Point::new(0.0, 0.0), 10.0).is_none());
    }
}
