//! Wires the geometric core's feature extractor and ICP solver to the
//! shared application context: given a robot's current map, align it to
//! the reference and persist the result.

use std::sync::Arc;

use tudomesh_core::features;
use tudomesh_core::icp::{self, IcpConfig};
use tudomesh_core::map::OccupancyMap;

use crate::context::{now_unix, AppContext};

/// Aligns `map` (robot `vacuum_id`'s current map) against the reference
/// robot's currently-known map, updates the calibration store on success,
/// and records the outcome in metrics. Errors are returned, not swallowed,
/// so the ingress layer can decide how to log each soft failure.
pub fn recalibrate(
    context: &Arc<AppContext>,
    vacuum_id: &str,
    map: &OccupancyMap,
    config: &IcpConfig,
) -> Result<(), tudomesh_core::CoreError> {
    let reference_id = context.reference_id();
    if vacuum_id == reference_id {
        context
            .update_calibration(vacuum_id, Default::default(), map.total_layer_area(), now_unix())
            .ok();
        return Ok(());
    }

    let Some(reference_map) = context.map_snapshot(&reference_id) else {
        return Err(tudomesh_core::CoreError::InsufficientSignal {
            source_points: 0,
            target_points: 0,
        });
    };

    let source_features = features::extract(map);
    let target_features = features::extract(&reference_map);

    let result = icp::solve(&source_features, &target_features, config);
    match &result {
        Ok(r) => {
            context.metrics.record_icp_outcome(if r.converged {
                "converged"
            } else {
                "max_iterations"
            });
        }
        Err(tudomesh_core::CoreError::InsufficientSignal { .. }) => {
            context.metrics.record_icp_outcome("insufficient_signal")
        }
        Err(tudomesh_core::CoreError::AlignmentFailed { .. }) => {
            context.metrics.record_icp_outcome("alignment_failed")
        }
        Err(_) => context.metrics.record_icp_outcome("error"),
    }

    let result = result?;

    context
        .update_calibration(vacuum_id, result.transform, map.total_layer_area(), now_unix())
        .map_err(|e| tudomesh_core::CoreError::CorruptCache {
            path: context.calibration_cache_path.display().to_string(),
            reason: e.to_string(),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use tudomesh_core::map::{Cell, GridSize, Layer, LayerType};

    fn square_map(side: i32) -> OccupancyMap {
        let mut pixels = Vec::new();
        for x in 0..side {
            for y in 0..side {
                if x == 0 || y == 0 || x == side - 1 || y == side - 1 {
                    pixels.push(Cell::new(x, y));
                }
            }
        }
        OccupancyMap {
            size: GridSize {
                width: side as u32,
                height: side as u32,
            },
            pixel_size_mm: 10,
            layers: vec![Layer {
                layer_type: LayerType::Wall,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![],
        }
    }

    #[test]
    fn recalibrate_reference_robot_stores_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reference = Some("robotA".to_string());
        let context = AppContext::new(
            config,
            dir.path().to_path_buf(),
            dir.path().join("calibration.json"),
            Arc::new(Metrics::new()),
        )
        .unwrap();

        let map = square_map(10);
        recalibrate(&context, "robotA", &map, &IcpConfig::default()).unwrap();
        let (transform, _) = context.get_transform("robotA");
        assert_eq!(transform, tudomesh_core::geometry::AffineMatrix::IDENTITY);
    }

    #[test]
    fn recalibrate_without_reference_map_known_is_insufficient_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reference = Some("robotA".to_string());
        let context = AppContext::new(
            config,
            dir.path().to_path_buf(),
            dir.path().join("calibration.json"),
            Arc::new(Metrics::new()),
        )
        .unwrap();

        let map = square_map(10);
        let err = recalibrate(&context, "robotB", &map, &IcpConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            tudomesh_core::CoreError::InsufficientSignal { .. }
        ));
    }

    #[test]
    fn recalibrate_aligns_identical_map_to_near_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reference = Some("robotA".to_string());
        let context = AppContext::new(
            config,
            dir.path().to_path_buf(),
            dir.path().join("calibration.json"),
            Arc::new(Metrics::new()),
        )
        .unwrap();

        let map = square_map(10);
        context.set_map("robotA", map.clone());

        recalibrate(&context, "robotB", &map, &IcpConfig::default()).unwrap();
        let (transform, missing) = context.get_transform("robotB");
        assert!(!missing);
        assert!(transform.frobenius_distance(&tudomesh_core::geometry::AffineMatrix::IDENTITY) < 1e-2);
    }
}
