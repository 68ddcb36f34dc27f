use thiserror::Error;

/// Error kinds surfaced by the geometric core.
///
/// Propagation policy lives with the caller: ingress handlers log these at
/// `warn` and discard them, calibration keeps the previous cached transform
/// on anything but `CorruptCache`, and only `ConfigInvalid`-equivalent
/// errors up in the `tudomesh` crate are fatal.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("calibration cache at {path} is corrupt: {reason}")]
    CorruptCache { path: String, reason: String },

    #[error("feature set has too few points for ICP (source has {source_points}, target has {target_points})")]
    InsufficientSignal {
        source_points: usize,
        target_points: usize,
    },

    #[error("correspondence set is rank-deficient, falling back to translation-only fit")]
    DegenerateGeometry,

    #[error("ICP converged to an invalid transform: det={det:.6}, rotation_mod_90={rotation_mod_90_deg:.3}deg")]
    AlignmentFailed {
        det: f64,
        rotation_mod_90_deg: f64,
    },

    #[error("payload for vacuum {vacuum_id} has no robot_position entity")]
    NoPoseInPayload { vacuum_id: String },

    #[error("payload for vacuum {vacuum_id} could not be decoded as a map")]
    UnusableMapPayload { vacuum_id: String },
}
