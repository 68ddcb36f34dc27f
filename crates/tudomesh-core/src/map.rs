//! The decoded occupancy grid and its metadata.
//!
//! Layer pixels and entity points live in *different* units: layer pixels
//! are integer grid cells, entity points are millimetres in the robot's
//! local frame. Any cross-use requires dividing by `pixel_size_mm`.

use serde::{Deserialize, Serialize};

/// Integer grid-cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Floor,
    Wall,
    Segment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    pub pixels: Vec<Cell>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    RobotPosition,
    ChargerLocation,
    Path,
}

/// A millimetre point in the robot's local frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MmPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub points: Vec<MmPoint>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Entity {
    /// Heading in degrees for a `robot_position` entity; defaults to 0 when
    /// the `angle` metadata field is absent (spec boundary behaviour).
    pub fn heading_deg(&self) -> f64 {
        self.metadata
            .get("angle")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

fn default_pixel_size() -> u32 {
    5
}

/// Deserializes `pixel_size`, treating `0` (and absence, via `serde`'s
/// `default`) as the documented default of 5mm/cell.
fn deserialize_pixel_size<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<u32>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(0) => default_pixel_size(),
        Some(v) => v,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyMap {
    pub size: GridSize,
    #[serde(
        rename = "pixelSize",
        default = "default_pixel_size",
        deserialize_with = "deserialize_pixel_size"
    )]
    pub pixel_size_mm: u32,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl OccupancyMap {
    /// Sum of layer cell counts, the staleness indicator referenced in
    /// calibration freshness checks.
    pub fn total_layer_area(&self) -> u64 {
        self.layers.iter().map(|l| l.pixels.len() as u64).sum()
    }

    pub fn layers_of_type(&self, layer_type: LayerType) -> impl Iterator<Item = &Layer> {
        self.layers
            .iter()
            .filter(move |l| l.layer_type == layer_type)
    }

    pub fn entities_of_type(&self, entity_type: EntityType) -> impl Iterator<Item = &Entity> {
        self.entities
            .iter()
            .filter(move |e| e.entity_type == entity_type)
    }

    /// The robot's local pose in millimetres and its heading in degrees,
    /// taken from the first `robot_position` entity. `None` if absent.
    pub fn robot_pose_mm(&self) -> Option<(MmPoint, f64)> {
        let entity = self.entities_of_type(EntityType::RobotPosition).next()?;
        let point = *entity.points.first()?;
        Some((point, entity.heading_deg()))
    }

    pub fn has_charger(&self) -> bool {
        self.entities_of_type(EntityType::ChargerLocation)
            .next()
            .is_some()
    }

    /// True when neither a floor nor a wall layer is present — the
    /// extractor yields an empty `Features` bundle in that case.
    pub fn has_no_drawable_layers(&self) -> bool {
        !self.layers_of_type(LayerType::Floor).any(|l| !l.pixels.is_empty())
            && !self.layers_of_type(LayerType::Wall).any(|l| !l.pixels.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_size_zero_defaults_to_five() {
        let json = r#"{"size":{"width":1,"height":1},"pixelSize":0,"layers":[],"entities":[]}"#;
        let map: OccupancyMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.pixel_size_mm, 5);
    }

    #[test]
    fn pixel_size_absent_defaults_to_five() {
        let json = r#"{"size":{"width":1,"height":1}}"#;
        let map: OccupancyMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.pixel_size_mm, 5);
    }

    #[test]
    fn missing_angle_metadata_defaults_heading_to_zero() {
        let entity = Entity {
            entity_type: EntityType::RobotPosition,
            points: vec![MmPoint { x: 0.0, y: 0.0 }],
            metadata: serde_json::json!({}),
        };
        assert_eq!(entity.heading_deg(), 0.0);
    }

    #[test]
    fn zero_layers_has_no_drawable_layers() {
        let map = OccupancyMap {
            size: GridSize { width: 1, height: 1 },
            pixel_size_mm: 5,
            layers: vec![],
            entities: vec![],
        };
        assert!(map.has_no_drawable_layers());
        assert_eq!(map.total_layer_area(), 0);
    }
}
