//! Persistent, disk-backed mapping from robot identifier to its affine
//! transform. Single-writer-many-reader discipline: the aligner mutates,
//! renderers and the live pose pipeline only read.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::AffineMatrix;

/// A stored transform is stale once either threshold is crossed.
pub const STALE_AREA_FRACTION: f64 = 0.05;
pub const STALE_AGE_SECONDS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationEntry {
    #[serde(default = "default_one")]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
    #[serde(default)]
    pub c: f64,
    #[serde(default = "default_one")]
    pub d: f64,
    #[serde(default)]
    pub tx: f64,
    #[serde(default)]
    pub ty: f64,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default, rename = "mapAreaAtCalibration")]
    pub map_area_at_calibration: u64,
}

fn default_one() -> f64 {
    1.0
}

impl CalibrationEntry {
    pub fn identity_at(now_unix: i64, map_area: u64) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx: 0.0,
            ty: 0.0,
            last_updated: now_unix,
            map_area_at_calibration: map_area,
        }
    }

    pub fn transform(&self) -> AffineMatrix {
        AffineMatrix {
            a: self.a,
            b: self.b,
            c: self.c,
            d: self.d,
            tx: self.tx,
            ty: self.ty,
        }
    }

    fn from_transform(transform: AffineMatrix, last_updated: i64, map_area: u64) -> Self {
        Self {
            a: transform.a,
            b: transform.b,
            c: transform.c,
            d: transform.d,
            tx: transform.tx,
            ty: transform.ty,
            last_updated,
            map_area_at_calibration: map_area,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub reference_vacuum: String,
    #[serde(default)]
    pub vacuums: HashMap<String, CalibrationEntry>,
}

impl Calibration {
    pub fn new(reference_vacuum: impl Into<String>) -> Self {
        let reference_vacuum = reference_vacuum.into();
        let mut vacuums = HashMap::new();
        vacuums.insert(reference_vacuum.clone(), CalibrationEntry::identity_at(0, 0));
        Self {
            reference_vacuum,
            vacuums,
        }
    }

    /// Returns the stored transform for `id`. The reference id always
    /// yields Identity. An id with no stored entry also yields Identity,
    /// with `missing = true` so callers can treat it as "untransformed".
    pub fn get_transform(&self, id: &str) -> (AffineMatrix, bool) {
        if id == self.reference_vacuum {
            return (AffineMatrix::IDENTITY, false);
        }
        match self.vacuums.get(id) {
            Some(entry) => (entry.transform(), false),
            None => (AffineMatrix::IDENTITY, true),
        }
    }

    /// Replaces any existing entry for `id`. Writing the reference id's
    /// entry always stores Identity regardless of the transform passed in.
    pub fn update(&mut self, id: &str, transform: AffineMatrix, map_area: u64, now_unix: i64) {
        let entry = if id == self.reference_vacuum {
            CalibrationEntry::identity_at(now_unix, map_area)
        } else {
            CalibrationEntry::from_transform(transform, now_unix, map_area)
        };
        self.vacuums.insert(id.to_string(), entry);
    }

    /// Sets the reference vacuum, rewriting its stored entry to Identity.
    pub fn set_reference(&mut self, id: &str, now_unix: i64) {
        self.reference_vacuum = id.to_string();
        let area = self
            .vacuums
            .get(id)
            .map(|e| e.map_area_at_calibration)
            .unwrap_or(0);
        self.vacuums
            .insert(id.to_string(), CalibrationEntry::identity_at(now_unix, area));
    }

    /// A stored transform for `id` is stale if its map area has drifted by
    /// more than `STALE_AREA_FRACTION` or it hasn't been refreshed in over
    /// `STALE_AGE_SECONDS`. An id with no entry at all is always stale.
    pub fn is_stale(&self, id: &str, current_map_area: u64, now_unix: i64) -> bool {
        let Some(entry) = self.vacuums.get(id) else {
            return true;
        };
        let area_delta_fraction = if entry.map_area_at_calibration == 0 {
            if current_map_area == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (current_map_area as f64 - entry.map_area_at_calibration as f64).abs()
                / entry.map_area_at_calibration as f64
        };
        let age_seconds = now_unix - entry.last_updated;
        area_delta_fraction > STALE_AREA_FRACTION || age_seconds > STALE_AGE_SECONDS
    }
}

/// Loads a calibration cache from `path`. A missing file yields `Ok(None)`;
/// a file that exists but fails to parse yields `CorruptCache`.
pub fn load(path: &Path) -> Result<Option<Calibration>, CoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CoreError::CorruptCache {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| CoreError::CorruptCache {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Atomically persists `calibration` to `path`: write to a sibling temp
/// file, then rename over the destination. A crash mid-write never leaves
/// a partially-written file at `path` (the rename is the only step that
/// touches the final name).
pub fn save(path: &Path, calibration: &Calibration) -> Result<(), CoreError> {
    let serialized = serde_json::to_string_pretty(calibration).map_err(|e| CoreError::CorruptCache {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serialized).map_err(|e| CoreError::CorruptCache {
        path: tmp_path.display().to_string(),
        reason: e.to_string(),
    })?;
    fs::rename(&tmp_path, path).map_err(|e| CoreError::CorruptCache {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Picks the reference robot when none is configured.
///
/// Prefers the existing calibration's reference if that robot's map is
/// still present (`known_map_areas` carries it); otherwise picks the
/// robot with the largest area, tie-breaking alphabetically on id.
pub fn select_reference(
    existing: Option<&Calibration>,
    known_map_areas: &HashMap<String, u64>,
) -> Option<String> {
    if let Some(calibration) = existing {
        if known_map_areas.contains_key(&calibration.reference_vacuum) {
            return Some(calibration.reference_vacuum.clone());
        }
    }
    known_map_areas
        .iter()
        .max_by(|(id_a, area_a), (id_b, area_b)| {
            area_a.cmp(area_b).then_with(|| id_b.cmp(id_a))
        })
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_id_returns_identity_and_missing_flag() {
        let calibration = Calibration::new("robotA");
        let (transform, missing) = calibration.get_transform("robotB");
        assert_eq!(transform, AffineMatrix::IDENTITY);
        assert!(missing);
    }

    #[test]
    fn reference_id_is_always_identity() {
        let mut calibration = Calibration::new("robotA");
        calibration.update(
            "robotA",
            AffineMatrix::rotation_translation(1.0, nalgebra::Vector2::new(5.0, 5.0)),
            100,
            0,
        );
        let (transform, missing) = calibration.get_transform("robotA");
        assert_eq!(transform, AffineMatrix::IDENTITY);
        assert!(!missing);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        let mut calibration = Calibration::new("robotA");
        calibration.update(
            "robotB",
            AffineMatrix::rotation_translation(0.1, nalgebra::Vector2::new(1.0, 2.0)),
            500,
            1_000,
        );

        save(&path, &calibration).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.reference_vacuum, calibration.reference_vacuum);
        assert_eq!(
            loaded.vacuums.get("robotB").unwrap().map_area_at_calibration,
            500
        );
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_yields_corrupt_cache_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        fs::write(&path, "not json at all {{{").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, CoreError::CorruptCache { .. }));
    }

    #[test]
    fn staleness_triggers_on_area_drift() {
        let mut calibration = Calibration::new("robotA");
        calibration.update("robotB", AffineMatrix::IDENTITY, 1000, 0);
        assert!(!calibration.is_stale("robotB", 1020, 10));
        assert!(calibration.is_stale("robotB", 1100, 10));
    }

    #[test]
    fn staleness_triggers_on_age() {
        let mut calibration = Calibration::new("robotA");
        calibration.update("robotB", AffineMatrix::IDENTITY, 1000, 0);
        assert!(!calibration.is_stale("robotB", 1000, STALE_AGE_SECONDS - 1));
        assert!(calibration.is_stale("robotB", 1000, STALE_AGE_SECONDS + 1));
    }

    #[test]
    fn select_reference_prefers_existing_reference_when_its_map_still_present() {
        let calibration = Calibration::new("robotA");
        let mut areas = HashMap::new();
        areas.insert("robotA".to_string(), 10);
        areas.insert("robotB".to_string(), 1000);
        assert_eq!(
            select_reference(Some(&calibration), &areas),
            Some("robotA".to_string())
        );
    }

    #[test]
    fn select_reference_falls_back_to_largest_area_when_previous_reference_is_gone() {
        let calibration = Calibration::new("robotA");
        let mut areas = HashMap::new();
        areas.insert("robotB".to_string(), 500);
        areas.insert("robotC".to_string(), 1000);
        assert_eq!(
            select_reference(Some(&calibration), &areas),
            Some("robotC".to_string())
        );
    }

    #[test]
    fn select_reference_ties_break_alphabetically() {
        let mut areas = HashMap::new();
        areas.insert("robotZ".to_string(), 500);
        areas.insert("robotA".to_string(), 500);
        assert_eq!(select_reference(None, &areas), Some("robotA".to_string()));
    }

    #[test]
    fn select_reference_with_no_candidates_is_none() {
        assert_eq!(select_reference(None, &HashMap::new()), None);
    }

    #[test]
    fn missing_numeric_fields_default_to_identity() {
        let json = r#"{"referenceVacuum":"robotA","vacuums":{"robotB":{}}}"#;
        let calibration: Calibration = serde_json::from_str(json).unwrap();
        let (transform, _) = calibration.get_transform("robotB");
        assert_eq!(transform, AffineMatrix::IDENTITY);
    }
}
