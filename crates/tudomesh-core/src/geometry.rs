//! Rigid 2-D transforms and the point type ICP and the feature extractor
//! operate on.

use nalgebra::{Matrix2, Point2, Vector2};

/// A 2-D coordinate. Whether it is in grid cells or millimetres depends on
/// context — see `map::OccupancyMap`'s module docs for the unit boundary.
pub type Point = Point2<f64>;

/// A rigid-plus-translation 2×3 matrix, applied as
/// `(x', y') = (a*x + b*y + tx, c*x + d*y + ty)`.
///
/// Invariant upheld by every constructor in this module: `a*d - b*c ≈ 1`
/// (unit-scale rotation), within `DET_TOLERANCE`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

/// Tolerance for the `a*d - b*c ≈ 1` rotation invariant.
pub const DET_TOLERANCE: f64 = 1e-6;

impl AffineMatrix {
    pub const IDENTITY: AffineMatrix = AffineMatrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Builds a pure rotation (by `theta_rad`) followed by a translation.
    pub fn rotation_translation(theta_rad: f64, translation: Vector2<f64>) -> Self {
        let (s, c) = theta_rad.sin_cos();
        Self {
            a: c,
            b: -s,
            c: s,
            d: c,
            tx: translation.x,
            ty: translation.y,
        }
    }

    pub fn from_rotation_matrix(rot: &Matrix2<f64>, translation: Vector2<f64>) -> Self {
        Self {
            a: rot[(0, 0)],
            b: rot[(0, 1)],
            c: rot[(1, 0)],
            d: rot[(1, 1)],
            tx: translation.x,
            ty: translation.y,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.b * p.y + self.tx,
            self.c * p.x + self.d * p.y + self.ty,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    /// Rotation angle in radians, derived from the `(a, c)` column (i.e.
    /// where the x-axis basis vector maps to). Matches `atan2(c, a)` used
    /// by the live pose pipeline's heading delta.
    pub fn rotation_angle_rad(&self) -> f64 {
        self.c.atan2(self.a)
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.a, self.b, self.c, self.d)
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.tx, self.ty)
    }

    /// Frobenius norm of `self - other`, used by the idempotency property
    /// test (`||T - Identity||_F < 1e-3`).
    pub fn frobenius_distance(&self, other: &AffineMatrix) -> f64 {
        let da = self.a - other.a;
        let db = self.b - other.b;
        let dc = self.c - other.c;
        let dd = self.d - other.d;
        let dtx = self.tx - other.tx;
        let dty = self.ty - other.ty;
        (da * da + db * db + dc * dc + dd * dd + dtx * dtx + dty * dty).sqrt()
    }

    /// True iff this matrix satisfies the stored-transform invariant: a
    /// unit-scale rotation (determinant within `DET_TOLERANCE` of 1) with
    /// finite translation.
    pub fn is_valid_rigid_transform(&self) -> bool {
        (self.determinant() - 1.0).abs() < DET_TOLERANCE
            && self.tx.is_finite()
            && self.ty.is_finite()
    }

    /// Composes `self` with `other`, applying `other` first: `self ∘ other`.
    pub fn compose(&self, other: &AffineMatrix) -> AffineMatrix {
        let rot = self.rotation_matrix() * other.rotation_matrix();
        let translation = self.rotation_matrix() * other.translation() + self.translation();
        Self::from_rotation_matrix(&rot, translation)
    }
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Normalises an angle in degrees to `[0, 360)`.
pub fn normalize_deg(deg: f64) -> f64 {
    let wrapped = deg % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}
