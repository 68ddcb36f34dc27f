//! On-disk per-robot map snapshots: a stable naming contract with the
//! upstream robot firmware, not something this crate is free to rename.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tudomesh_core::map::OccupancyMap;

pub const SNAPSHOT_PREFIX: &str = "ValetudoMapExport-";

/// Renders the timestamp as an RFC3339-ish UTC string (`2024-01-02T03:04:05.006Z`)
/// rather than a bare epoch value: `vacuum_id_from_file_name` splits on the
/// first `-2` it finds, matching the ISO-year leader the upstream Valetudo
/// firmware's own snapshot names use. A bare epoch millisecond value has no
/// such leader (it starts with `1` for any timestamp before the year 2286),
/// so the split would never fire and the recovered id would keep the
/// timestamp as a suffix.
pub fn snapshot_file_name(vacuum_id: &str, timestamp_unix_ms: i64) -> String {
    let timestamp = chrono::DateTime::from_timestamp_millis(timestamp_unix_ms)
        .expect("timestamp_unix_ms out of range")
        .format("%Y-%m-%dT%H:%M:%S%.3fZ");
    format!("{SNAPSHOT_PREFIX}{vacuum_id}-{timestamp}.json")
}

/// Recovers a vacuum id from a snapshot file name by stripping the prefix
/// and anything from the first `-2` (a timestamp leader, e.g. `-2024...`)
/// onward.
pub fn vacuum_id_from_file_name(file_name: &str) -> Option<String> {
    let stripped = file_name.strip_prefix(SNAPSHOT_PREFIX)?;
    let stripped = stripped.strip_suffix(".json").unwrap_or(stripped);
    let id = match stripped.find("-2") {
        Some(idx) => &stripped[..idx],
        None => stripped,
    };
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Returns the lexicographically-latest snapshot path for `vacuum_id`
/// under `data_dir` (timestamp suffixes sort lexicographically because
/// the fixed-width `%Y-%m-%dT%H:%M:%S%.3fZ` format sorts the same as
/// chronological order).
pub fn latest_snapshot_path(data_dir: &Path, vacuum_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(data_dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(vacuum_id_from_file_name)
                .as_deref()
                == Some(vacuum_id)
        })
        .map(|entry| entry.path())
        .max_by_key(|path| path.file_name().map(|n| n.to_os_string()))
}

pub fn load_snapshot(path: &Path) -> anyhow::Result<OccupancyMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode snapshot {}", path.display()))
}

pub fn write_snapshot_bytes(
    data_dir: &Path,
    vacuum_id: &str,
    timestamp_unix_ms: i64,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(snapshot_file_name(vacuum_id, timestamp_unix_ms));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_id_with_timestamp_suffix() {
        assert_eq!(
            vacuum_id_from_file_name("ValetudoMapExport-robotA-20240102.json"),
            Some("robotA".to_string())
        );
    }

    #[test]
    fn recovers_id_without_timestamp_suffix() {
        assert_eq!(
            vacuum_id_from_file_name("ValetudoMapExport-robotA.json"),
            Some("robotA".to_string())
        );
    }

    #[test]
    fn ignores_unrelated_file_names() {
        assert_eq!(vacuum_id_from_file_name("not-a-snapshot.json"), None);
    }

    #[test]
    fn file_name_round_trips_back_to_the_same_vacuum_id() {
        let name = snapshot_file_name("robotA", 1_700_000_000_000);
        assert_eq!(vacuum_id_from_file_name(&name), Some("robotA".to_string()));
    }

    #[test]
    fn latest_snapshot_picks_highest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot_bytes(dir.path(), "robotA", 1_700_000_000_000, b"{}").unwrap();
        write_snapshot_bytes(dir.path(), "robotA", 1_800_000_000_000, b"{}").unwrap();
        write_snapshot_bytes(dir.path(), "robotB", 1_900_000_000_000, b"{}").unwrap();

        let latest = latest_snapshot_path(dir.path(), "robotA").unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            snapshot_file_name("robotA", 1_800_000_000_000)
        );
    }
}
