//! Stationary covariance kernel for the distortion field.
//!
//! The residual distortion between frames is modeled as a zero-mean GP with
//! a Matérn ν = 3/2 kernel: stationary, isotropic, once-differentiable —
//! smooth enough for optical distortion, rough enough not to over-commit far
//! from the data. The kernel carries two hyperparameters: a length-scale
//! `scale` and a 2×2 symmetric PSD `amplitude` coupling the x and y field
//! components.

use nalgebra::DMatrix;

use crate::error::AlignError;
use crate::{Matrix2, Vector2};

/// Pairwise squared Euclidean distances between two coordinate sets.
pub fn squared_distances(x: &[Vector2], y: &[Vector2]) -> DMatrix<f64> {
    DMatrix::from_fn(x.len(), y.len(), |i, j| (x[i] - y[j]).norm_squared())
}

/// Amplitude specification for [`MaternKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmplitudeSpec {
    /// Isotropic amplitude `a·I`.
    Scalar(f64),
    /// Common diagonal amplitude with a cross-component term.
    Symmetric { diag: f64, cross: f64 },
    /// Full 2×2 amplitude matrix.
    Full(Matrix2),
}

impl AmplitudeSpec {
    /// Normalize into a 2×2 matrix, validating symmetry and positive
    /// semidefiniteness.
    pub(crate) fn into_matrix(self) -> Result<Matrix2, AlignError> {
        let m = match self {
            AmplitudeSpec::Scalar(a) => Matrix2::new(a, 0.0, 0.0, a),
            AmplitudeSpec::Symmetric { diag, cross } => Matrix2::new(diag, cross, cross, diag),
            AmplitudeSpec::Full(m) => m,
        };

        let tol = 1e-12 * m.amax().max(1.0);
        if (m[(0, 1)] - m[(1, 0)]).abs() > tol {
            return Err(AlignError::AmplitudeNotPsd);
        }
        let det = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];
        if m[(0, 0)] < 0.0 || m[(1, 1)] < 0.0 || det < -tol {
            return Err(AlignError::AmplitudeNotPsd);
        }
        Ok(m)
    }
}

/// Matérn ν = 3/2 kernel over squared distances.
#[derive(Debug, Clone, PartialEq)]
pub struct MaternKernel {
    scale: f64,
    amp: Matrix2,
}

impl MaternKernel {
    pub fn new(scale: f64, amp: AmplitudeSpec) -> Result<Self, AlignError> {
        Ok(Self {
            scale,
            amp: amp.into_matrix()?,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn amplitude(&self) -> &Matrix2 {
        &self.amp
    }

    /// Correlation as a function of squared distance:
    /// `(1 + √3·r/ℓ) · exp(−√3·r/ℓ)`.
    #[inline]
    pub fn correlation(&self, d2: f64) -> f64 {
        let t = (3.0 * d2).sqrt() / self.scale;
        (1.0 + t) * (-t).exp()
    }

    /// Dense block covariance between two location sets.
    ///
    /// Entries are ordered `(x0, y0, x1, y1, …)`: block `(i, j)` is
    /// `amplitude · correlation(d²ᵢⱼ)`. When `nugget` is supplied (square
    /// inputs only), its per-point 2×2 measurement-covariance blocks are
    /// added along the diagonal.
    pub fn evaluate(&self, d2: &DMatrix<f64>, nugget: Option<&[Matrix2]>) -> DMatrix<f64> {
        let (n, m) = d2.shape();
        let mut c = DMatrix::zeros(2 * n, 2 * m);
        for i in 0..n {
            for j in 0..m {
                let k = self.correlation(d2[(i, j)]);
                for r in 0..2 {
                    for s in 0..2 {
                        c[(2 * i + r, 2 * j + s)] = self.amp[(r, s)] * k;
                    }
                }
            }
        }
        if let Some(var) = nugget {
            for (i, v) in var.iter().enumerate() {
                for r in 0..2 {
                    for s in 0..2 {
                        c[(2 * i + r, 2 * i + s)] += v[(r, s)];
                    }
                }
            }
        }
        c
    }

    /// Single-axis covariance (n×m) using that axis' diagonal amplitude,
    /// optionally with per-point nugget variances on the diagonal.
    pub fn evaluate_axis(
        &self,
        d2: &DMatrix<f64>,
        axis: usize,
        nugget: Option<&[f64]>,
    ) -> DMatrix<f64> {
        let a = self.amp[(axis, axis)];
        let mut c = d2.map(|v| a * self.correlation(v));
        if let Some(var) = nugget {
            for (i, v) in var.iter().enumerate() {
                c[(i, i)] += v;
            }
        }
        c
    }
}
