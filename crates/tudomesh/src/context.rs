//! The application's one shared context — calibration cache, reference id,
//! and config — created once at startup and passed to every ingress and
//! HTTP handler as a single `Arc`, so there are no process-wide mutable
//! globals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tudomesh_core::calibration::{self, Calibration};
use tudomesh_core::geometry::AffineMatrix;
use tudomesh_core::map::OccupancyMap;
use tudomesh_core::pose::LivePose;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::snapshot;

/// Shared application state. Cheap to clone (it's handed out as `Arc`):
/// the decoded map per robot swaps atomically under a write lock and
/// readers snapshot-read, the calibration store has a single writer, and
/// pose state is a per-robot cell guarded by a short-held mutex.
pub struct AppContext {
    pub config: Config,
    pub data_dir: PathBuf,
    pub calibration_cache_path: PathBuf,
    pub metrics: Arc<Metrics>,
    calibration: Mutex<Calibration>,
    maps: DashMap<String, RwLock<Option<OccupancyMap>>>,
    poses: DashMap<String, Mutex<LivePose>>,
    robot_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppContext {
    pub fn new(
        config: Config,
        data_dir: PathBuf,
        calibration_cache_path: PathBuf,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let calibration = bootstrap_calibration(&config, &data_dir, &calibration_cache_path)?;
        Ok(Arc::new(Self {
            config,
            data_dir,
            calibration_cache_path,
            metrics,
            calibration: Mutex::new(calibration),
            maps: DashMap::new(),
            poses: DashMap::new(),
            robot_locks: DashMap::new(),
        }))
    }

    /// Serialises ingress handlers for the same robot: the lock is
    /// per-robot, held only for the duration of one payload's processing,
    /// so handlers for different robots never block each other.
    pub fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.robot_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn reference_id(&self) -> String {
        self.calibration.lock().reference_vacuum.clone()
    }

    pub fn get_transform(&self, id: &str) -> (AffineMatrix, bool) {
        let (transform, missing) = self.calibration.lock().get_transform(id);
        if missing {
            self.metrics.calibration_cache_misses_total.inc();
        } else {
            self.metrics.calibration_cache_hits_total.inc();
        }
        (transform, missing)
    }

    pub fn is_stale(&self, id: &str, current_map_area: u64, now_unix: i64) -> bool {
        self.calibration.lock().is_stale(id, current_map_area, now_unix)
    }

    /// The single-writer path: updates the in-memory calibration and
    /// persists it to disk under the same lock, so the in-memory copy
    /// never drifts from the on-disk copy after a successful call.
    pub fn update_calibration(
        &self,
        id: &str,
        transform: AffineMatrix,
        map_area: u64,
        now_unix: i64,
    ) -> anyhow::Result<()> {
        let mut calibration = self.calibration.lock();
        calibration.update(id, transform, map_area, now_unix);
        calibration::save(&self.calibration_cache_path, &calibration)?;
        Ok(())
    }

    pub fn set_map(&self, id: &str, map: OccupancyMap) {
        self.maps
            .entry(id.to_string())
            .or_insert_with(|| RwLock::new(None));
        *self.maps.get(id).unwrap().write() = Some(map);
        self.metrics.known_robots.set(self.maps.len() as i64);
    }

    pub fn map_snapshot(&self, id: &str) -> Option<OccupancyMap> {
        self.maps.get(id)?.read().clone()
    }

    pub fn known_vacuum_ids(&self) -> Vec<String> {
        self.maps.iter().map(|e| e.key().clone()).collect()
    }

    pub fn set_pose(&self, pose: LivePose) {
        self.poses
            .entry(pose.vacuum_id.clone())
            .and_modify(|cell| *cell.lock() = pose.clone())
            .or_insert_with(|| Mutex::new(pose));
    }

    pub fn pose(&self, id: &str) -> Option<LivePose> {
        self.poses.get(id).map(|cell| cell.lock().clone())
    }

    pub fn all_poses(&self) -> Vec<LivePose> {
        self.poses.iter().map(|e| e.value().lock().clone()).collect()
    }
}

fn bootstrap_calibration(
    config: &Config,
    data_dir: &Path,
    calibration_cache_path: &Path,
) -> anyhow::Result<Calibration> {
    let existing = calibration::load(calibration_cache_path)?;

    if let Some(reference_id) = &config.reference {
        let mut calibration = existing.unwrap_or_else(|| Calibration::new(reference_id));
        if &calibration.reference_vacuum != reference_id {
            calibration.set_reference(reference_id, now_unix());
        }
        return Ok(calibration);
    }

    let mut known_map_areas = std::collections::HashMap::new();
    for vacuum in &config.vacuums {
        if let Some(path) = snapshot::latest_snapshot_path(data_dir, &vacuum.id) {
            if let Ok(map) = snapshot::load_snapshot(&path) {
                known_map_areas.insert(vacuum.id.clone(), map.total_layer_area());
            }
        }
    }

    let reference_id = calibration::select_reference(existing.as_ref(), &known_map_areas)
        .or_else(|| config.vacuums.first().map(|v| v.id.clone()))
        .unwrap_or_else(|| "reference".to_string());

    Ok(existing.unwrap_or_else(|| Calibration::new(&reference_id)))
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
