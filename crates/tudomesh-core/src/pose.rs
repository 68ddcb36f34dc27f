//! Per-payload processing for a single robot's incoming map message:
//! decide whether to replace the stored map, and derive a world-frame pose
//! if one is available.
//!
//! This module is pure — no disk or network I/O. The binary crate's
//! ingress handler owns persisting raw bytes, caching decoded maps, and
//! publishing `LivePose` onward; this module only decides what those
//! actions *should* be for a given payload and transform.

use crate::error::CoreError;
use crate::geometry::{AffineMatrix, Point};
use crate::map::OccupancyMap;

/// The three shapes an incoming map message can take.
#[derive(Debug, Clone)]
pub enum MapPayload {
    DecodedMap(OccupancyMap),
    RawImage(Vec<u8>),
    Unparseable,
}

/// A robot's pose in reference (world) grid coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePose {
    pub vacuum_id: String,
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
}

/// What the caller should do with its per-robot map store after processing
/// this payload.
#[derive(Debug, Clone)]
pub enum MapUpdate {
    /// Payload wasn't a decodable map; persist these bytes verbatim (if
    /// any were carried) and leave pose state untouched.
    Unusable(Option<Vec<u8>>),
    /// Replace the stored rich map with this newly decoded one.
    ReplaceMap(OccupancyMap),
    /// Lightweight pose-only update: keep whatever rich map was already
    /// stored for this robot.
    KeepPrevious,
}

/// Result of processing one payload for one robot.
#[derive(Debug, Clone)]
pub struct ProcessedPayload {
    pub map_update: MapUpdate,
    pub pose: Option<LivePose>,
    /// A non-fatal classification failure (`UnusableMapPayload` or
    /// `NoPoseInPayload`) worth logging at the call site. Never blocks
    /// `map_update` from taking effect.
    pub soft_error: Option<CoreError>,
}

/// Runs the live pose pipeline's contract for one payload from `vacuum_id`,
/// using `transform` as the robot's current calibration.
pub fn process_payload(
    vacuum_id: &str,
    payload: MapPayload,
    transform: AffineMatrix,
) -> ProcessedPayload {
    let map = match payload {
        MapPayload::RawImage(bytes) => {
            return ProcessedPayload {
                map_update: MapUpdate::Unusable(Some(bytes)),
                pose: None,
                soft_error: Some(CoreError::UnusableMapPayload {
                    vacuum_id: vacuum_id.to_string(),
                }),
            }
        }
        MapPayload::Unparseable => {
            return ProcessedPayload {
                map_update: MapUpdate::Unusable(None),
                pose: None,
                soft_error: Some(CoreError::UnusableMapPayload {
                    vacuum_id: vacuum_id.to_string(),
                }),
            }
        }
        MapPayload::DecodedMap(map) => map,
    };

    let map_update = if map.has_no_drawable_layers() {
        MapUpdate::KeepPrevious
    } else {
        MapUpdate::ReplaceMap(map.clone())
    };

    let Some((robot_pos_mm, heading_deg)) = map.robot_pose_mm() else {
        return ProcessedPayload {
            map_update,
            pose: None,
            soft_error: Some(CoreError::NoPoseInPayload {
                vacuum_id: vacuum_id.to_string(),
            }),
        };
    };

    let pixel_size = map.pixel_size_mm as f64;
    let robot_pos_grid = Point::new(robot_pos_mm.x / pixel_size, robot_pos_mm.y / pixel_size);
    let world_pos = transform.apply(robot_pos_grid);
    let heading_delta_deg = transform.rotation_angle_rad().to_degrees();
    let world_heading = crate::geometry::normalize_deg(heading_deg + heading_delta_deg);

    ProcessedPayload {
        map_update,
        pose: Some(LivePose {
            vacuum_id: vacuum_id.to_string(),
            x: world_pos.x,
            y: world_pos.y,
            heading_deg: world_heading,
        }),
        soft_error: None,
    }
}
