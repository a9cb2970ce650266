//! Bivariate Gaussian positional estimates and their transform algebra.
//!
//! A tie object — a detection of the same source in two frames — is carried
//! through the alignment pipeline as a [`BivariateGaussian`]: a 2-D mean with
//! a full 2×2 covariance. The type is immutable after construction; algebra
//! ([`add`](BivariateGaussian::add), [`sub`](BivariateGaussian::sub),
//! [`transform`](BivariateGaussian::transform)) produces new instances.
//!
//! Two degenerate shapes are handled explicitly:
//!
//! - **Points** — total variance exactly zero. These carry a zero covariance,
//!   skip the eigendecomposition entirely, and refuse to be sampled.
//! - **Singular directions** — one axis with zero variance. These still get a
//!   valid (rank-deficient) Cholesky factor, so sampling collapses onto the
//!   non-degenerate axis instead of failing.

use std::fmt;

use nalgebra::SymmetricEigen;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::AlignError;
use crate::mapping::{rotation, FrameMap};
use crate::{MapParams, Matrix2, Vector2};

/// Covariance specification accepted at construction.
///
/// The variants mirror the shorthand forms a catalog typically provides:
/// a single variance, per-axis variances, per-axis variances plus a
/// correlation term, or the full matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CovarianceSpec {
    /// The same variance on both axes, no correlation.
    Isotropic(f64),
    /// Independent per-axis variances.
    Diagonal(f64, f64),
    /// Per-axis variances plus an off-diagonal covariance term.
    Correlated { var_x: f64, var_y: f64, cov: f64 },
    /// Full 2×2 covariance matrix (symmetrized on input).
    Full(Matrix2),
}

impl CovarianceSpec {
    fn into_matrix(self) -> Matrix2 {
        match self {
            CovarianceSpec::Isotropic(v) => Matrix2::new(v, 0.0, 0.0, v),
            CovarianceSpec::Diagonal(vx, vy) => Matrix2::new(vx, 0.0, 0.0, vy),
            CovarianceSpec::Correlated { var_x, var_y, cov } => {
                Matrix2::new(var_x, cov, cov, var_y)
            }
            CovarianceSpec::Full(m) => {
                let c = 0.5 * (m[(0, 1)] + m[(1, 0)]);
                Matrix2::new(m[(0, 0)], c, c, m[(1, 1)])
            }
        }
    }
}

/// A 2-D Gaussian positional estimate, or a degenerate point.
#[derive(Debug, Clone, PartialEq)]
pub struct BivariateGaussian {
    mean: Vector2,
    cov: Matrix2,
    /// Eigenvalues on the diagonal; zero for points.
    eigvals: Matrix2,
    /// Eigenvectors as columns; identity for points.
    eigvecs: Matrix2,
    /// Lower-triangular Cholesky factor; `None` for points.
    chol: Option<Matrix2>,
    det: f64,
    trace: f64,
    /// Principal-axis orientation in degrees; `None` for points.
    orientation_deg: Option<f64>,
    point: bool,
}

impl BivariateGaussian {
    /// Build an estimate from a mean and a covariance specification.
    ///
    /// Negative variances are rejected with
    /// [`AlignError::NegativeVariance`]. A spec with total variance exactly
    /// zero produces a degenerate point (see [`is_point`](Self::is_point)).
    pub fn new(mean: Vector2, spec: CovarianceSpec) -> Result<Self, AlignError> {
        Self::with_rotation(mean, spec, 0.0)
    }

    /// Like [`new`](Self::new), but rotates the covariance eigenbasis by
    /// `rotation_rad` before reconstituting the matrix.
    pub fn with_rotation(
        mean: Vector2,
        spec: CovarianceSpec,
        rotation_rad: f64,
    ) -> Result<Self, AlignError> {
        let sigma = spec.into_matrix();
        let (var_x, var_y) = (sigma[(0, 0)], sigma[(1, 1)]);
        if var_x < 0.0 || var_y < 0.0 {
            return Err(AlignError::NegativeVariance { var_x, var_y });
        }

        if var_x + var_y == 0.0 {
            return Ok(Self::degenerate(mean));
        }

        let eig = SymmetricEigen::new(sigma);
        let eigvals = Matrix2::from_diagonal(&eig.eigenvalues);
        let mut eigvecs = eig.eigenvectors;

        if rotation_rad != 0.0 {
            eigvecs = rotation(rotation_rad) * eigvecs;
        }

        // Reconstitute from the (possibly rotated) eigenbasis
        let cov = eigvecs * eigvals * eigvecs.transpose();

        let det = cov[(0, 0)] * cov[(1, 1)] - cov[(0, 1)] * cov[(1, 0)];
        let trace = cov[(0, 0)] + cov[(1, 1)];
        let chol = lower_cholesky(&cov);

        // Principal axis: the eigenvector with the largest eigenvalue
        let leading = if eigvals[(0, 0)] >= eigvals[(1, 1)] { 0 } else { 1 };
        let orientation_deg = eigvecs[(1, leading)]
            .atan2(eigvecs[(0, leading)])
            .to_degrees();

        Ok(Self {
            mean,
            cov,
            eigvals,
            eigvecs,
            chol: Some(chol),
            det,
            trace,
            orientation_deg: Some(orientation_deg),
            point: false,
        })
    }

    /// A zero-uncertainty point at `mean`.
    pub fn point(mean: Vector2) -> Self {
        Self::degenerate(mean)
    }

    fn degenerate(mean: Vector2) -> Self {
        Self {
            mean,
            cov: Matrix2::zeros(),
            eigvals: Matrix2::zeros(),
            eigvecs: Matrix2::identity(),
            chol: None,
            det: 0.0,
            trace: 0.0,
            orientation_deg: None,
            point: true,
        }
    }

    pub fn mean(&self) -> Vector2 {
        self.mean
    }

    pub fn covariance(&self) -> &Matrix2 {
        &self.cov
    }

    pub fn determinant(&self) -> f64 {
        self.det
    }

    pub fn trace(&self) -> f64 {
        self.trace
    }

    /// Lower-triangular Cholesky factor of the covariance; `None` for points.
    pub fn cholesky_factor(&self) -> Option<&Matrix2> {
        self.chol.as_ref()
    }

    /// Orientation of the principal covariance axis in degrees; `None` for
    /// points.
    pub fn orientation_deg(&self) -> Option<f64> {
        self.orientation_deg
    }

    /// Whether this estimate is a degenerate zero-uncertainty point.
    pub fn is_point(&self) -> bool {
        self.point
    }

    /// Combine with another independent estimate: means add, covariances add.
    pub fn add(&self, other: &Self) -> Result<Self, AlignError> {
        Self::new(
            self.mean + other.mean,
            CovarianceSpec::Full(self.cov + other.cov),
        )
    }

    /// Difference of two independent estimates. Means subtract; covariances
    /// still add, since the errors are independent either way.
    pub fn sub(&self, other: &Self) -> Result<Self, AlignError> {
        Self::new(
            self.mean - other.mean,
            CovarianceSpec::Full(self.cov + other.cov),
        )
    }

    /// Push this estimate through a background mapping.
    ///
    /// The mean is scaled, shifted, and rotated about the mapping's center;
    /// the covariance is propagated by scaling the eigenvalue matrix with
    /// diag(L), rotating the eigenbasis, and reconstituting. Points keep
    /// their zero covariance.
    ///
    /// The result is a [`TransientGaussian`]: transform outputs are usually
    /// intermediate, so the eigendecomposition and factorization are skipped
    /// until [`promote`](TransientGaussian::promote) is called.
    pub fn transform(&self, map: &FrameMap) -> TransientGaussian {
        self.transform_params(map.params())
    }

    /// [`transform`](Self::transform) with a raw 7-parameter vector.
    pub fn transform_params(&self, p: &MapParams) -> TransientGaussian {
        let u = rotation(p[2]);
        let shift = Vector2::new(p[0], p[1]);
        let center = Vector2::new(p[3], p[4]);
        let scale = Vector2::new(p[5], p[6]);

        let mean = u * (self.mean.component_mul(&scale) + shift - center) + center;

        let cov = if self.point {
            Matrix2::zeros()
        } else {
            let v = u * self.eigvecs;
            let e = Matrix2::from_diagonal(&scale) * self.eigvals;
            v * e * v.transpose()
        };

        let det = cov[(0, 0)] * cov[(1, 1)] - cov[(0, 1)] * cov[(1, 0)];
        TransientGaussian { mean, cov, det }
    }

    /// Draw `n` independent samples.
    ///
    /// Fails with [`AlignError::PointSample`] on a degenerate point.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<Vector2>, AlignError> {
        let chol = self.chol.as_ref().ok_or(AlignError::PointSample)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let z = Vector2::new(rng.sample(StandardNormal), rng.sample(StandardNormal));
            out.push(self.mean + chol * z);
        }
        Ok(out)
    }
}

impl fmt::Display for BivariateGaussian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.point {
            return write!(f, "point at ({:.6}, {:.6})", self.mean.x, self.mean.y);
        }
        let sx = self.cov[(0, 0)].sqrt();
        let sy = self.cov[(1, 1)].sqrt();
        let rho = if sx > 0.0 && sy > 0.0 {
            self.cov[(0, 1)] / (sx * sy)
        } else {
            0.0
        };
        write!(
            f,
            "mu: ({:.6}, {:.6}), [sx sy]: ({:.6}, {:.6}), rho_xy: {:.4}",
            self.mean.x, self.mean.y, sx, sy, rho
        )
    }
}

/// Lightweight transform result.
///
/// Carries only the moments needed for further likelihood work. Transformed
/// estimates are usually consumed immediately (residual computation,
/// regression output assembly), so the derived quantities of the full type
/// are deferred until the value is promoted.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientGaussian {
    pub mean: Vector2,
    pub cov: Matrix2,
    pub det: f64,
}

impl TransientGaussian {
    /// Rebuild the full estimate, recomputing the eigendecomposition,
    /// Cholesky factor, and orientation.
    pub fn promote(&self) -> Result<BivariateGaussian, AlignError> {
        BivariateGaussian::new(self.mean, CovarianceSpec::Full(self.cov))
    }
}

/// Closed-form lower Cholesky factor of a 2×2 PSD matrix.
///
/// A zero leading variance (distribution degenerate along x) is factored as
/// a rank-deficient lower triangle rather than failing.
fn lower_cholesky(cov: &Matrix2) -> Matrix2 {
    let a = cov[(0, 0)];
    if a <= 0.0 {
        return Matrix2::new(0.0, 0.0, 0.0, cov[(1, 1)].max(0.0).sqrt());
    }
    let l00 = a.sqrt();
    let l10 = cov[(1, 0)] / l00;
    let l11 = (cov[(1, 1)] - l10 * l10).max(0.0).sqrt();
    Matrix2::new(l00, 0.0, l10, l11)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_covariance_spec_equivalence() {
        // The same matrix through every spec form must agree on the
        // derived quantities.
        let mean = Vector2::new(1.0, -2.0);
        let forms = [
            BivariateGaussian::new(mean, CovarianceSpec::Isotropic(2.0)).unwrap(),
            BivariateGaussian::new(mean, CovarianceSpec::Diagonal(2.0, 2.0)).unwrap(),
            BivariateGaussian::new(
                mean,
                CovarianceSpec::Correlated {
                    var_x: 2.0,
                    var_y: 2.0,
                    cov: 0.0,
                },
            )
            .unwrap(),
            BivariateGaussian::new(mean, CovarianceSpec::Full(Matrix2::new(2.0, 0.0, 0.0, 2.0)))
                .unwrap(),
        ];

        let reference = &forms[0];
        for g in &forms[1..] {
            assert!(
                (g.determinant() - reference.determinant()).abs() < 1e-12,
                "determinant mismatch: {} vs {}",
                g.determinant(),
                reference.determinant(),
            );
            assert!((g.trace() - reference.trace()).abs() < 1e-12);
            let (ca, cb) = (
                g.cholesky_factor().unwrap(),
                reference.cholesky_factor().unwrap(),
            );
            assert!((ca - cb).amax() < 1e-12, "cholesky mismatch");
        }
    }

    #[test]
    fn test_negative_variance_rejected() {
        let result = BivariateGaussian::new(Vector2::zeros(), CovarianceSpec::Diagonal(-1.0, 1.0));
        assert!(matches!(
            result,
            Err(AlignError::NegativeVariance { .. })
        ));
    }

    #[test]
    fn test_point_degenerate() {
        let g = BivariateGaussian::new(Vector2::new(3.0, 4.0), CovarianceSpec::Diagonal(0.0, 0.0))
            .unwrap();
        assert!(g.is_point());
        assert_eq!(g.covariance().amax(), 0.0);
        assert_eq!(g.determinant(), 0.0);
        assert!(g.cholesky_factor().is_none());
        assert!(g.orientation_deg().is_none());

        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(g.sample(1, &mut rng), Err(AlignError::PointSample)));
    }

    #[test]
    fn test_add_sub_moments() {
        let a = BivariateGaussian::new(
            Vector2::new(1.0, 2.0),
            CovarianceSpec::Correlated {
                var_x: 1.0,
                var_y: 2.0,
                cov: 0.3,
            },
        )
        .unwrap();
        let b = BivariateGaussian::new(Vector2::new(-0.5, 4.0), CovarianceSpec::Diagonal(0.5, 0.25))
            .unwrap();

        let sum = a.add(&b).unwrap();
        assert!((sum.mean() - Vector2::new(0.5, 6.0)).norm() < 1e-12);
        assert!((sum.covariance() - (a.covariance() + b.covariance())).amax() < 1e-12);

        // Covariances add under subtraction too: the errors are independent
        let diff = a.sub(&b).unwrap();
        assert!((diff.mean() - Vector2::new(1.5, -2.0)).norm() < 1e-12);
        assert!((diff.covariance() - (a.covariance() + b.covariance())).amax() < 1e-12);
    }

    #[test]
    fn test_identity_transform_roundtrip() {
        let g = BivariateGaussian::new(
            Vector2::new(10.0, -5.0),
            CovarianceSpec::Correlated {
                var_x: 4.0,
                var_y: 1.0,
                cov: 0.5,
            },
        )
        .unwrap();

        // Identity map: zero shift and rotation, unit scale, arbitrary center
        let map = FrameMap::new(
            Vector2::zeros(),
            0.0,
            Vector2::new(37.0, -12.0),
            Vector2::new(1.0, 1.0),
        );
        let t = g.transform(&map);
        assert!((t.mean - g.mean()).norm() < 1e-12, "mean moved: {:?}", t.mean);
        assert!((t.cov - g.covariance()).amax() < 1e-12, "covariance changed");
    }

    #[test]
    fn test_translation_transform() {
        let g = BivariateGaussian::new(Vector2::new(1.0, 1.0), CovarianceSpec::Isotropic(1.0))
            .unwrap();
        let map = FrameMap::new(
            Vector2::new(2.0, -1.0),
            0.0,
            Vector2::zeros(),
            Vector2::new(1.0, 1.0),
        );
        let t = g.transform(&map);
        assert!((t.mean - Vector2::new(3.0, 0.0)).norm() < 1e-12);
        assert!((t.cov - g.covariance()).amax() < 1e-12);
    }

    #[test]
    fn test_rotation_about_center() {
        // A distribution sitting at the rotation center keeps its mean but
        // rotates its covariance: diag(4, 1) becomes diag(1, 4) under 90°.
        let center = Vector2::new(5.0, 5.0);
        let g = BivariateGaussian::new(center, CovarianceSpec::Diagonal(4.0, 1.0)).unwrap();
        let map = FrameMap::new(
            Vector2::zeros(),
            std::f64::consts::FRAC_PI_2,
            center,
            Vector2::new(1.0, 1.0),
        );
        let t = g.transform(&map);
        assert!((t.mean - center).norm() < 1e-12);
        assert!((t.cov - Matrix2::new(1.0, 0.0, 0.0, 4.0)).amax() < 1e-9);
    }

    #[test]
    fn test_constructor_rotation() {
        let g = BivariateGaussian::with_rotation(
            Vector2::zeros(),
            CovarianceSpec::Diagonal(4.0, 1.0),
            std::f64::consts::FRAC_PI_2,
        )
        .unwrap();
        assert!((g.covariance() - &Matrix2::new(1.0, 0.0, 0.0, 4.0)).amax() < 1e-9);
    }

    #[test]
    fn test_orientation_angle() {
        // Larger variance along y: the principal axis is vertical.
        let g = BivariateGaussian::new(Vector2::zeros(), CovarianceSpec::Diagonal(1.0, 4.0))
            .unwrap();
        let angle = g.orientation_deg().unwrap();
        assert!(
            (angle.abs() - 90.0).abs() < 1e-9,
            "expected ±90°, got {angle}",
        );
    }

    #[test]
    fn test_singular_direction_sampling() {
        // Zero variance along x is not a point: samples collapse onto x.
        let g = BivariateGaussian::new(Vector2::new(2.0, 3.0), CovarianceSpec::Diagonal(0.0, 1.0))
            .unwrap();
        assert!(!g.is_point());

        let chol = g.cholesky_factor().unwrap();
        assert_eq!(chol[(0, 0)], 0.0);
        assert!((chol[(1, 1)] - 1.0).abs() < 1e-12);

        let mut rng = StdRng::seed_from_u64(42);
        for s in g.sample(100, &mut rng).unwrap() {
            assert_eq!(s.x, 2.0);
        }
    }

    #[test]
    fn test_sampling_moments() {
        let g = BivariateGaussian::new(
            Vector2::new(1.0, -1.0),
            CovarianceSpec::Correlated {
                var_x: 2.0,
                var_y: 1.0,
                cov: 0.8,
            },
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(1234);
        let samples = g.sample(4000, &mut rng).unwrap();

        let n = samples.len() as f64;
        let mean = samples.iter().fold(Vector2::zeros(), |acc, s| acc + s) / n;
        assert!((mean - g.mean()).norm() < 0.1, "sample mean {mean:?}");

        let mut cov = Matrix2::zeros();
        for s in &samples {
            let d = s - mean;
            cov += d * d.transpose();
        }
        cov /= n - 1.0;
        assert!(
            (cov - g.covariance()).amax() < 0.2,
            "sample covariance {cov:?}",
        );
    }

    #[test]
    fn test_transient_promote() {
        let g = BivariateGaussian::new(
            Vector2::new(0.0, 0.0),
            CovarianceSpec::Correlated {
                var_x: 3.0,
                var_y: 2.0,
                cov: -0.4,
            },
        )
        .unwrap();
        let map = FrameMap::new(
            Vector2::new(1.0, 1.0),
            0.1,
            Vector2::zeros(),
            Vector2::new(1.0, 1.0),
        );

        let t = g.transform(&map);
        let full = t.promote().unwrap();
        assert!((full.mean() - t.mean).norm() < 1e-12);
        assert!((full.covariance() - &t.cov).amax() < 1e-9);
        assert!(full.cholesky_factor().is_some());
        assert!((full.determinant() - t.det).abs() < 1e-9);
    }
}
