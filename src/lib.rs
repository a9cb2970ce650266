//! # astralign
//!
//! **Bayesian astrometric alignment** between two image frames, written in Rust.
//!
//! Given two lists of matched "tie objects" — detections of the same physical
//! sources in two frames, each carried as a 2-D position with a full
//! covariance — `astralign` fits a global background mapping (translation,
//! rotation about a center, per-axis scale) and models the remaining
//! small-scale distortion as a Gaussian process. The combined model predicts
//! the frame-to-frame mapping, with propagated uncertainty, at arbitrary new
//! locations.
//!
//! ## Features
//!
//! - **Bivariate-Gaussian algebra** — positional estimates compose additively
//!   and push through affine-similarity transforms with their covariance
//! - **Background mapping** — a 7-parameter similarity transform with a
//!   Gaussian likelihood over its parameters, fit by derivative-free
//!   least squares
//! - **Distortion field** — Matérn-kernel GP regression over the residual
//!   displacements, with maximum-likelihood hyperparameter conditioning
//! - **Degenerate-case aware** — zero-uncertainty points, singular covariance
//!   directions, and unconstrained (infinite-variance) parameters are all
//!   first-class
//!
//! ## Example
//!
//! ```
//! # fn main() -> Result<(), astralign::AlignError> {
//! use astralign::{
//!     BivariateGaussian, CovarianceSpec, DistortionField, FitConfig, FrameMap,
//!     RegressionInput, Vector2,
//! };
//!
//! // Matched detections in two frames, offset by a pure translation
//! let positions = [
//!     Vector2::new(0.0, 0.0),
//!     Vector2::new(120.0, 15.0),
//!     Vector2::new(35.0, 90.0),
//!     Vector2::new(-45.0, 60.0),
//!     Vector2::new(80.0, -55.0),
//! ];
//! let frame_a = positions
//!     .iter()
//!     .map(|&p| BivariateGaussian::new(p, CovarianceSpec::Isotropic(0.25)))
//!     .collect::<Result<Vec<_>, _>>()?;
//! let frame_b = frame_a
//!     .iter()
//!     .map(|o| {
//!         BivariateGaussian::new(
//!             o.mean() + Vector2::new(2.0, -1.0),
//!             CovarianceSpec::Isotropic(0.25),
//!         )
//!     })
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! // Fit the global background mapping, then model residual distortion
//! let map = FrameMap::fit(&frame_a, &frame_b, &FitConfig::default())?;
//! let mut field = DistortionField::new(frame_a, frame_b, map)?;
//! field.build_covariance(Some(200.0), None)?;
//!
//! // Predict the mapping (with uncertainty) at a new location
//! let predicted = field.regress(RegressionInput::Point(Vector2::new(120.0, 80.0)))?;
//! println!("{}", predicted[0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Background fit** — minimize the summed squared mapping error of the
//!    tie pairs over the 7 transform parameters (Nelder–Mead simplex)
//! 2. **Residuals** — subtract the mapping's predicted displacement from each
//!    observed pair displacement
//! 3. **Conditioning** — maximize the GP likelihood of the residuals over the
//!    kernel length-scale and amplitude (Cholesky-factored, per axis)
//! 4. **Regression** — predict the posterior residual mean and covariance at
//!    query locations and fold them into the transformed positional estimates

pub mod error;
pub mod field;
pub mod gaussian;
pub mod mapping;

pub use error::AlignError;
pub use field::kernel::{squared_distances, AmplitudeSpec, MaternKernel};
pub use field::optimize::{minimize, MinimizeConfig, MinimizeResult};
pub use field::{
    grid, ConditionConfig, Conditioning, DistortionField, ParamSubset, RegressionInput,
    TieDisplacements,
};
pub use gaussian::{BivariateGaussian, CovarianceSpec, TransientGaussian};
pub use mapping::{FitConfig, FrameMap};

// Commonly used types
// All core math runs in 64-bit floats: the eigendecompositions and GP
// factorizations here are too cancellation-sensitive for f32.
pub type Vector2 = nalgebra::Vector2<f64>;
pub type Matrix2 = nalgebra::Matrix2<f64>;
/// Background-mapping parameter vector, ordered (dx, dy, theta, d0x, d0y, Lx, Ly).
pub type MapParams = nalgebra::SVector<f64, 7>;
/// Covariance over the seven background-mapping parameters.
pub type MapCovariance = nalgebra::SMatrix<f64, 7, 7>;
