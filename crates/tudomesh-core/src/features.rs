//! Derives the geometric point clouds and statistics ICP consumes from one
//! `OccupancyMap`. Pure function, no side effects.

use std::collections::HashSet;

use crate::geometry::Point;
use crate::map::{Cell, LayerType, OccupancyMap};

/// Cap on the number of points kept from the floor layer's sparse sample
/// (spec: "stride chosen so that ≤ ~2 000 points remain").
const GRID_SAMPLE_CAP: usize = 2_000;

/// Number of 5°-wide bins covering the 0–180° range wall-edge orientations
/// are quantised into.
const ANGLE_BIN_COUNT: usize = 36;
const ANGLE_BIN_WIDTH_DEG: f64 = 180.0 / ANGLE_BIN_COUNT as f64;

/// Relative weight applied to a feature point during ICP's weighted rigid
/// fit; mirrors the `cornerWeight` / `gridWeight` / `wallWeight` config
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Corner,
    Wall,
    Grid,
    Boundary,
}

#[derive(Debug, Clone, Copy)]
pub struct WeightedPoint {
    pub point: Point,
    pub kind: PointKind,
}

/// The geometric bundle derived from one map, consumed by the ICP solver.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub wall_points: Vec<Point>,
    pub grid_points: Vec<Point>,
    pub boundary_points: Vec<Point>,
    pub corners: Vec<Point>,
    /// Count per 5°-wide bin, 36 bins covering `[0, 180)`.
    pub wall_angle_histogram: [u32; ANGLE_BIN_COUNT],
    pub has_charger: bool,
}

impl Features {
    pub fn is_empty(&self) -> bool {
        self.wall_points.is_empty()
            && self.grid_points.is_empty()
            && self.boundary_points.is_empty()
    }

    /// All points ICP should correspond against, weighted by feature kind.
    /// Each point appears exactly once: `extract` excludes corner cells from
    /// `boundary_points`, so a cell that qualifies as a corner is listed only
    /// under `PointKind::Corner`, never also under `PointKind::Boundary`.
    pub fn weighted_points(&self) -> Vec<WeightedPoint> {
        let mut out = Vec::with_capacity(
            self.wall_points.len()
                + self.grid_points.len()
                + self.boundary_points.len()
                + self.corners.len(),
        );
        for &p in &self.corners {
            out.push(WeightedPoint {
                point: p,
                kind: PointKind::Corner,
            });
        }
        for &p in &self.wall_points {
            out.push(WeightedPoint {
                point: p,
                kind: PointKind::Wall,
            });
        }
        for &p in &self.boundary_points {
            out.push(WeightedPoint {
                point: p,
                kind: PointKind::Boundary,
            });
        }
        for &p in &self.grid_points {
            out.push(WeightedPoint {
                point: p,
                kind: PointKind::Grid,
            });
        }
        out
    }

    /// Returns up to `k` dominant wall-angle bin centres (degrees), highest
    /// count first, ties broken by first occurrence (ascending bin index).
    pub fn dominant_angles(&self, k: usize) -> Vec<f64> {
        let mut indexed: Vec<(usize, u32)> = self
            .wall_angle_histogram
            .iter()
            .copied()
            .enumerate()
            .collect();
        indexed.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        indexed
            .into_iter()
            .filter(|&(_, count)| count > 0)
            .take(k)
            .map(|(bin, _)| bin_center_deg(bin))
            .collect()
    }
}

fn bin_center_deg(bin: usize) -> f64 {
    (bin as f64 + 0.5) * ANGLE_BIN_WIDTH_DEG
}

const NEIGHBOR_4: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const WINDOW_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Extracts the `Features` bundle for one occupancy map. Returns an empty
/// bundle when neither a floor nor a wall layer carries any pixels.
pub fn extract(map: &OccupancyMap) -> Features {
    let mut features = Features {
        has_charger: map.has_charger(),
        ..Default::default()
    };

    if map.has_no_drawable_layers() {
        return features;
    }

    let wall_cells: HashSet<Cell> = map
        .layers_of_type(LayerType::Wall)
        .flat_map(|l| l.pixels.iter().copied())
        .collect();
    let floor_cells: HashSet<Cell> = map
        .layers_of_type(LayerType::Floor)
        .flat_map(|l| l.pixels.iter().copied())
        .collect();

    features.wall_points = wall_cells.iter().map(cell_to_point).collect();
    features.wall_angle_histogram = wall_angle_histogram(&wall_cells);

    let boundary_cells = boundary_cells(&floor_cells);
    let corners = corner_cells(&boundary_cells);
    let corner_set: HashSet<Cell> = corners.iter().copied().collect();
    features.boundary_points = boundary_cells
        .iter()
        .filter(|cell| !corner_set.contains(cell))
        .map(cell_to_point)
        .collect();
    features.corners = corners.iter().map(cell_to_point).collect();

    features.grid_points = sample_floor(&floor_cells);

    features
}

fn cell_to_point(cell: &Cell) -> Point {
    Point::new(cell.x as f64, cell.y as f64)
}

fn boundary_cells(floor_cells: &HashSet<Cell>) -> HashSet<Cell> {
    floor_cells
        .iter()
        .filter(|cell| {
            NEIGHBOR_4.iter().any(|&(dx, dy)| {
                !floor_cells.contains(&Cell::new(cell.x + dx, cell.y + dy))
            })
        })
        .copied()
        .collect()
}

/// A boundary cell is a corner iff, within its 3×3 window, the count of
/// boundary neighbours is in `[3, 5]` and the two farthest-apart neighbour
/// directions differ by more than 45°.
fn corner_cells(boundary_cells: &HashSet<Cell>) -> Vec<Cell> {
    boundary_cells
        .iter()
        .filter(|cell| is_corner(cell, boundary_cells))
        .copied()
        .collect()
}

fn is_corner(cell: &Cell, boundary_cells: &HashSet<Cell>) -> bool {
    let neighbor_angles_deg: Vec<f64> = WINDOW_8
        .iter()
        .filter(|&&(dx, dy)| boundary_cells.contains(&Cell::new(cell.x + dx, cell.y + dy)))
        .map(|&(dx, dy)| (dy as f64).atan2(dx as f64).to_degrees())
        .collect();

    if !(3..=5).contains(&neighbor_angles_deg.len()) {
        return false;
    }

    max_angular_spread_deg(&neighbor_angles_deg) > 45.0
}

/// Largest pairwise angular difference (mod 180°, since direction and its
/// opposite describe the same line) among a set of angles in degrees.
fn max_angular_spread_deg(angles_deg: &[f64]) -> f64 {
    let mut max_spread = 0.0_f64;
    for i in 0..angles_deg.len() {
        for j in (i + 1)..angles_deg.len() {
            let mut diff = (angles_deg[i] - angles_deg[j]).abs() % 180.0;
            if diff > 90.0 {
                diff = 180.0 - diff;
            }
            max_spread = max_spread.max(diff);
        }
    }
    max_spread
}

fn wall_angle_histogram(wall_cells: &HashSet<Cell>) -> [u32; ANGLE_BIN_COUNT] {
    let mut histogram = [0u32; ANGLE_BIN_COUNT];
    for cell in wall_cells {
        // Only walk the "positive" 4-connected neighbours so each edge is
        // counted once.
        for &(dx, dy) in &[(1, 0), (0, 1)] {
            let neighbor = Cell::new(cell.x + dx, cell.y + dy);
            if wall_cells.contains(&neighbor) {
                let angle_deg = (dy as f64).atan2(dx as f64).to_degrees();
                let bin = angle_to_bin(angle_deg);
                histogram[bin] += 1;
            }
        }
    }
    histogram
}

fn angle_to_bin(angle_deg: f64) -> usize {
    let mod180 = ((angle_deg % 180.0) + 180.0) % 180.0;
    ((mod180 / ANGLE_BIN_WIDTH_DEG).floor() as usize).min(ANGLE_BIN_COUNT - 1)
}

/// Emits a sparse sample of the floor layer, keeping every Nth cell in
/// insertion order so that at most `GRID_SAMPLE_CAP` points remain.
fn sample_floor(floor_cells: &HashSet<Cell>) -> Vec<Point> {
    if floor_cells.is_empty() {
        return Vec::new();
    }
    let stride = (floor_cells.len() / GRID_SAMPLE_CAP).max(1);
    let mut cells: Vec<&Cell> = floor_cells.iter().collect();
    cells.sort_by_key(|c| (c.y, c.x));
    cells
        .into_iter()
        .step_by(stride)
        .map(cell_to_point)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Entity, EntityType, GridSize, Layer, MmPoint};

    fn square_border_map(side: i32) -> OccupancyMap {
        let mut pixels = Vec::new();
        for x in 0..side {
            pixels.push(Cell::new(x, 0));
            pixels.push(Cell::new(x, side - 1));
        }
        for y in 0..side {
            pixels.push(Cell::new(0, y));
            pixels.push(Cell::new(side - 1, y));
        }
        OccupancyMap {
            size: GridSize {
                width: side as u32,
                height: side as u32,
            },
            pixel_size_mm: 5,
            layers: vec![Layer {
                layer_type: LayerType::Wall,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![Entity {
                entity_type: EntityType::RobotPosition,
                points: vec![MmPoint { x: 25.0, y: 25.0 }],
                metadata: serde_json::json!({"angle": 0.0}),
            }],
        }
    }

    #[test]
    fn empty_map_yields_empty_features() {
        let map = OccupancyMap {
            size: GridSize { width: 1, height: 1 },
            pixel_size_mm: 5,
            layers: vec![],
            entities: vec![],
        };
        let features = extract(&map);
        assert!(features.is_empty());
    }

    #[test]
    fn square_wall_border_is_all_wall_points() {
        let map = square_border_map(10);
        let features = extract(&map);
        assert_eq!(features.wall_points.len(), 36);
    }

    #[test]
    fn plus_shaped_cluster_center_is_a_corner() {
        // A thin single-pixel-wide boundary ring (e.g. a simple rectangular
        // room) never has more than 2 boundary neighbours per cell, so this
        // exercises `is_corner` directly against a cluster shape that does
        // — the kind of local blob real boundary extraction produces near
        // concave/convex corners of irregular rooms.
        let cells: HashSet<Cell> = [
            Cell::new(0, 0),
            Cell::new(1, 0),
            Cell::new(-1, 0),
            Cell::new(0, 1),
            Cell::new(0, -1),
        ]
        .into_iter()
        .collect();
        assert!(is_corner(&Cell::new(0, 0), &cells));
    }

    #[test]
    fn straight_wall_segment_is_not_a_corner() {
        let cells: HashSet<Cell> = (-2..=2).map(|x| Cell::new(x, 0)).collect();
        assert!(!is_corner(&Cell::new(0, 0), &cells));
    }

    #[test]
    fn dominant_angles_prefers_higher_count_then_first_occurrence() {
        let mut features = Features::default();
        features.wall_angle_histogram[0] = 5;
        features.wall_angle_histogram[1] = 5;
        features.wall_angle_histogram[2] = 1;
        let dominant = features.dominant_angles(2);
        assert_eq!(dominant.len(), 2);
        assert!((dominant[0] - bin_center_deg(0)).abs() < 1e-9);
        assert!((dominant[1] - bin_center_deg(1)).abs() < 1e-9);
    }

    #[test]
    fn corner_cells_are_excluded_from_boundary_points() {
        // Boundary/corner extraction runs on the floor layer.
        let mut pixels = Vec::new();
        for x in 0..10 {
            pixels.push(Cell::new(x, 0));
            pixels.push(Cell::new(x, 9));
        }
        for y in 0..10 {
            pixels.push(Cell::new(0, y));
            pixels.push(Cell::new(9, y));
        }
        let floor_map = OccupancyMap {
            size: GridSize { width: 10, height: 10 },
            pixel_size_mm: 5,
            layers: vec![Layer {
                layer_type: LayerType::Floor,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![],
        };
        let features = extract(&floor_map);
        assert!(!features.corners.is_empty());
        let corner_set: HashSet<(i64, i64)> = features
            .corners
            .iter()
            .map(|p| (p.x.round() as i64, p.y.round() as i64))
            .collect();
        for p in &features.boundary_points {
            let key = (p.x.round() as i64, p.y.round() as i64);
            assert!(!corner_set.contains(&key));
        }
    }

    #[test]
    fn grid_sample_respects_cap() {
        let mut pixels = Vec::new();
        for x in 0..100 {
            for y in 0..100 {
                pixels.push(Cell::new(x, y));
            }
        }
        let map = OccupancyMap {
            size: GridSize { width: 100, height: 100 },
            pixel_size_mm: 5,
            layers: vec![Layer {
                layer_type: LayerType::Floor,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![],
        };
        let features = extract(&map);
        assert!(features.grid_points.len() <= GRID_SAMPLE_CAP);
    }
}
