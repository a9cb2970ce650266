//! Error taxonomy for the alignment core.
//!
//! Every failure is raised at its detection point and propagates to the
//! caller unchanged: nothing is retried, recovered, or logged here, and no
//! operation leaves partial results behind.

use thiserror::Error;

/// Errors raised by the alignment core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlignError {
    /// A variance in a covariance specification is negative.
    #[error("variances must be non-negative, got ({var_x}, {var_y})")]
    NegativeVariance { var_x: f64, var_y: f64 },

    /// The kernel amplitude matrix fails the symmetry/PSD check.
    #[error("kernel amplitude must be a symmetric positive-semidefinite 2x2 matrix")]
    AmplitudeNotPsd,

    /// Tie-object lists for the two frames differ in length.
    #[error("tie-object lists differ in length: {len_a} vs {len_b}")]
    FrameMismatch { len_a: usize, len_b: usize },

    /// An operation over tie objects received empty lists.
    #[error("at least one tie-object pair is required")]
    NoTieObjects,

    /// Sampling was attempted on a degenerate point distribution.
    #[error("distribution is a point and cannot be sampled")]
    PointSample,

    /// Sampling was attempted on a parameter distribution with non-finite
    /// variance entries.
    #[error("parameter covariance has non-finite entries and cannot be sampled")]
    UnboundedSample,

    /// Regression or realization was attempted before the data covariance
    /// was built and factorized.
    #[error("data covariance has not been built; call build_covariance first")]
    CovarianceNotBuilt,

    /// A covariance matrix was not positive-definite at factorization time.
    #[error("covariance matrix is not positive-definite")]
    NotPositiveDefinite,

    /// A parameter covariance was singular during a likelihood solve.
    #[error("parameter covariance is singular")]
    SingularCovariance,
}
