//! Rotation-invariant Iterative Closest Point solver.
//!
//! Enumerates the four cardinal rotations (plus an optional hint) as
//! independent restarts, runs weighted-correspondence ICP to local
//! convergence from each, and picks the best by `score` — raw RMS error is
//! reported but never used to rank seeds, since larger maps have larger
//! absolute error by construction.

use nalgebra::{Matrix2, Vector2};

use crate::error::CoreError;
use crate::features::{Features, PointKind, WeightedPoint};
use crate::geometry::{AffineMatrix, Point};
use crate::spatial_grid::UniformGrid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpConfig {
    pub max_iterations: u32,
    pub convergence_tolerance: f64,
    pub max_distance: f64,
    pub corner_weight: f64,
    pub grid_weight: f64,
    pub wall_weight: f64,
    /// Extra rotation seed (degrees) to try alongside the four cardinals,
    /// when supplied and not itself already a multiple of 90°.
    pub initial_rotation_hint_deg: Option<f64>,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-4,
            max_distance: 50.0,
            corner_weight: 4.0,
            grid_weight: 0.25,
            wall_weight: 1.0,
            initial_rotation_hint_deg: None,
        }
    }
}

impl IcpConfig {
    fn weight_for(&self, kind: PointKind) -> f64 {
        match kind {
            PointKind::Corner => self.corner_weight,
            PointKind::Wall => self.wall_weight,
            PointKind::Grid => self.grid_weight,
            // Spec only names corner/grid/wall weights; boundary points
            // stand in for walls when a map lacks a distinct wall layer, so
            // they share the wall weight.
            PointKind::Boundary => self.wall_weight,
        }
    }
}

/// Minimum number of surviving correspondences below which an iteration is
/// reported as non-converged.
const MIN_INLIERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpResult {
    pub transform: AffineMatrix,
    pub iterations: u32,
    pub final_rms_error: f64,
    pub score: f64,
    pub inlier_fraction: f64,
    pub converged: bool,
    pub initial_rotation_deg: f64,
}

const CARDINAL_ROTATIONS_DEG: [f64; 4] = [0.0, 90.0, 180.0, 270.0];

/// Aligns `source` onto `target`, returning the best-scoring rigid
/// transform found across the cardinal-rotation restarts.
pub fn solve(source: &Features, target: &Features, config: &IcpConfig) -> Result<IcpResult, CoreError> {
    let source_points = source.weighted_points();
    let target_points = target.weighted_points();

    if source_points.is_empty() || target_points.is_empty() {
        return Err(CoreError::InsufficientSignal {
            source_points: source_points.len(),
            target_points: target_points.len(),
        });
    }

    let target_positions: Vec<Point> = target_points.iter().map(|wp| wp.point).collect();
    let target_index = UniformGrid::build(&target_positions, config.max_distance);

    let source_centroid = centroid(source_points.iter().map(|wp| wp.point));
    let target_centroid = centroid(target_points.iter().map(|wp| wp.point));

    let mut seeds = CARDINAL_ROTATIONS_DEG.to_vec();
    if let Some(hint) = config.initial_rotation_hint_deg {
        if (hint % 90.0).abs() > 1e-9 {
            seeds.push(hint);
        }
    }

    let mut best: Option<IcpResult> = None;
    for seed_deg in seeds {
        let (sin, cos) = seed_deg.to_radians().sin_cos();
        let rotation = Matrix2::new(cos, -sin, sin, cos);
        let seed_translation = target_centroid - rotation * source_centroid;
        let seed_transform = AffineMatrix::from_rotation_matrix(&rotation, seed_translation);
        let result = run_from_seed(&source_points, &target_index, seed_transform, seed_deg, config);
        best = Some(match best {
            None => result,
            Some(current_best) => pick_better(current_best, result),
        });
    }

    let best = best.expect("seeds is never empty");

    if !best.transform.is_valid_rigid_transform() || !is_near_rectilinear(&best.transform) {
        return Err(CoreError::AlignmentFailed {
            det: best.transform.determinant(),
            rotation_mod_90_deg: rotation_mod_90_deg(&best.transform),
        });
    }

    Ok(best)
}

fn centroid<I: Iterator<Item = Point>>(points: I) -> Vector2<f64> {
    let mut sum = Vector2::zeros();
    let mut count = 0usize;
    for p in points {
        sum += p.coords;
        count += 1;
    }
    if count == 0 {
        sum
    } else {
        sum / count as f64
    }
}

/// Runs ICP to local convergence from one seed transform.
fn run_from_seed(
    source_points: &[WeightedPoint],
    target_index: &UniformGrid,
    seed_transform: AffineMatrix,
    seed_deg: f64,
    config: &IcpConfig,
) -> IcpResult {
    let mut transform = seed_transform;
    let mut previous_mse = f64::MAX;
    let mut iterations_run = 0u32;
    let mut converged = false;
    let mut last_inlier_count = 0usize;
    let mut last_mean_inlier_error = config.max_distance;

    for iteration in 0..config.max_iterations {
        iterations_run = iteration + 1;

        let mut pairs: Vec<(Point, Point, f64)> = Vec::with_capacity(source_points.len());
        for wp in source_points {
            let transformed = transform.apply(wp.point);
            if let Some(matched) = target_index.nearest_within(transformed, config.max_distance) {
                pairs.push((wp.point, matched, config.weight_for(wp.kind)));
            }
        }

        if pairs.len() < MIN_INLIERS {
            last_inlier_count = pairs.len();
            converged = false;
            break;
        }

        let fit = fit_rigid(&pairs);
        if fit.degenerate {
            let reason = CoreError::DegenerateGeometry;
            tracing::warn!(%reason, "rank-deficient correspondence set");
        }
        let candidate_transform = AffineMatrix::from_rotation_matrix(&fit.rotation, fit.translation);

        let mse = mean_squared_error(&pairs, &candidate_transform);
        transform = candidate_transform;
        last_inlier_count = pairs.len();
        last_mean_inlier_error = mse.sqrt();

        if (previous_mse - mse).abs() < config.convergence_tolerance {
            converged = true;
            previous_mse = mse;
            break;
        }
        previous_mse = mse;
    }

    let inlier_fraction = last_inlier_count as f64 / source_points.len() as f64;
    let score = inlier_fraction * (-last_mean_inlier_error / config.max_distance).exp();

    IcpResult {
        transform,
        iterations: iterations_run,
        final_rms_error: previous_mse.sqrt(),
        score,
        inlier_fraction,
        converged: converged && last_inlier_count >= MIN_INLIERS,
        initial_rotation_deg: seed_deg,
    }
}

struct RigidFit {
    rotation: Matrix2<f64>,
    translation: Vector2<f64>,
    degenerate: bool,
}

/// Weighted Kabsch/Umeyama fit (rotation + translation only, no scale).
/// Falls back to a translation-only fit about the weighted centroids when
/// the correspondence set is rank-deficient (fewer than two independent
/// pairs, or a near-singular covariance matrix).
fn fit_rigid(pairs: &[(Point, Point, f64)]) -> RigidFit {
    let total_weight: f64 = pairs.iter().map(|(_, _, w)| w).sum();
    let mean_source = weighted_mean(pairs.iter().map(|(s, _, w)| (s.coords, *w)), total_weight);
    let mean_target = weighted_mean(pairs.iter().map(|(_, t, w)| (t.coords, *w)), total_weight);

    let mut covariance = Matrix2::zeros();
    for (s, t, w) in pairs {
        let ds = s.coords - mean_source;
        let dt = t.coords - mean_target;
        covariance += w * (ds * dt.transpose());
    }

    let svd = covariance.svd(true, true);
    let singular_values = svd.singular_values;
    let sv_max = singular_values.x.max(singular_values.y);
    let sv_min = singular_values.x.min(singular_values.y);
    let rank_deficient = pairs.len() < 2 || sv_min < 1e-9 * sv_max.max(1.0);

    if rank_deficient {
        return RigidFit {
            rotation: Matrix2::identity(),
            translation: mean_target - mean_source,
            degenerate: true,
        };
    }

    let u = svd.u.expect("compute_u was true");
    let v = svd.v_t.expect("compute_v was true").transpose();
    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v_fixed = v;
        v_fixed[(0, 1)] *= -1.0;
        v_fixed[(1, 1)] *= -1.0;
        rotation = v_fixed * u.transpose();
    }

    let translation = mean_target - rotation * mean_source;
    RigidFit {
        rotation,
        translation,
        degenerate: false,
    }
}

fn weighted_mean<I: Iterator<Item = (Vector2<f64>, f64)>>(points: I, total_weight: f64) -> Vector2<f64> {
    if total_weight <= 0.0 {
        return Vector2::zeros();
    }
    let mut sum = Vector2::zeros();
    for (p, w) in points {
        sum += w * p;
    }
    sum / total_weight
}

fn mean_squared_error(pairs: &[(Point, Point, f64)], transform: &AffineMatrix) -> f64 {
    let mut sum_sq = 0.0;
    for (s, t, _) in pairs {
        let transformed = transform.apply(*s);
        sum_sq += (transformed - t).norm_squared();
    }
    sum_sq / pairs.len() as f64
}

fn rotation_mod_90_deg(transform: &AffineMatrix) -> f64 {
    let deg = transform.rotation_angle_rad().to_degrees();
    let mod90 = deg.rem_euclid(90.0);
    mod90.min(90.0 - mod90)
}

fn is_near_rectilinear(transform: &AffineMatrix) -> bool {
    rotation_mod_90_deg(transform) <= 5.0
}

/// Picks the better of two seed results by `score`; within 1% of each
/// other, prefers the one whose rotation lands closer to a multiple of 90°
/// — cleaning robots overwhelmingly operate in rectilinear buildings, so
/// that seed is more likely the true alignment.
fn pick_better(a: IcpResult, b: IcpResult) -> IcpResult {
    let score_diff = (a.score - b.score).abs();
    let close_enough = score_diff <= 0.01 * a.score.max(b.score).max(1e-9);

    if close_enough {
        if rotation_mod_90_deg(&a.transform) <= rotation_mod_90_deg(&b.transform) {
            a
        } else {
            b
        }
    } else if a.score >= b.score {
        a
    } else {
        b
    }
}
