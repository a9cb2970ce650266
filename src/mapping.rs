//! Background frame-to-frame mapping.
//!
//! A [`FrameMap`] is the global, large-scale part of the astrometric
//! solution: a seven-parameter similarity transform — translation `dx`,
//! rotation `theta` about a center `d0`, per-axis scales `L` — that sends
//! frame-1 coordinates into frame 2:
//!
//! ```text
//! T(x) = U(theta) · (x ∘ L + dx − d0) + d0
//! ```
//!
//! The parameters carry a Gaussian distribution (mean `mu`, 7×7 covariance
//! `sigma`), so a map is also a likelihood over alternate parameter sets.
//! An infinite variance marks a parameter as unconstrained: it contributes
//! nothing to the quadratic form and is skipped by the likelihood solve.

use nalgebra::Cholesky;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, warn};

use crate::error::AlignError;
use crate::field::optimize::{minimize, MinimizeConfig};
use crate::gaussian::BivariateGaussian;
use crate::{MapCovariance, MapParams, Matrix2, Vector2};

/// Rotation matrix for `theta` radians, counter-clockwise.
#[inline]
pub(crate) fn rotation(theta: f64) -> Matrix2 {
    let (s, c) = theta.sin_cos();
    Matrix2::new(c, -s, s, c)
}

/// Seven-parameter background mapping with a Gaussian parameter
/// distribution. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMap {
    mu: MapParams,
    sigma: MapCovariance,
}

impl Default for FrameMap {
    /// Identity mapping with an unconstrained (infinite-variance) prior.
    fn default() -> Self {
        Self::identity()
    }
}

impl FrameMap {
    /// Mapping with the given central parameters and an unconstrained
    /// (infinite-variance) parameter distribution.
    pub fn new(shift: Vector2, theta: f64, center: Vector2, scale: Vector2) -> Self {
        let mu = MapParams::from([
            shift.x, shift.y, theta, center.x, center.y, scale.x, scale.y,
        ]);
        Self {
            mu,
            sigma: MapCovariance::from_diagonal_element(f64::INFINITY),
        }
    }

    /// The identity mapping: zero shift and rotation, unit scales.
    pub fn identity() -> Self {
        Self::new(
            Vector2::zeros(),
            0.0,
            Vector2::zeros(),
            Vector2::new(1.0, 1.0),
        )
    }

    /// Mapping from an explicit parameter mean and covariance.
    pub fn from_distribution(mu: MapParams, sigma: MapCovariance) -> Self {
        Self { mu, sigma }
    }

    /// Mapping from a parameter mean and per-parameter variances.
    pub fn from_diagonal(mu: MapParams, variances: MapParams) -> Self {
        Self {
            mu,
            sigma: MapCovariance::from_diagonal(&variances),
        }
    }

    pub fn params(&self) -> &MapParams {
        &self.mu
    }

    pub fn covariance(&self) -> &MapCovariance {
        &self.sigma
    }

    pub fn shift(&self) -> Vector2 {
        Vector2::new(self.mu[0], self.mu[1])
    }

    pub fn theta(&self) -> f64 {
        self.mu[2]
    }

    pub fn center(&self) -> Vector2 {
        Vector2::new(self.mu[3], self.mu[4])
    }

    pub fn scale(&self) -> Vector2 {
        Vector2::new(self.mu[5], self.mu[6])
    }

    /// Map a frame-1 location into frame 2.
    pub fn apply(&self, x: Vector2) -> Vector2 {
        Self::apply_params(&self.mu, x)
    }

    pub(crate) fn apply_params(p: &MapParams, x: Vector2) -> Vector2 {
        let u = rotation(p[2]);
        let scaled = Vector2::new(x.x * p[5], x.y * p[6]);
        let center = Vector2::new(p[3], p[4]);
        u * (scaled + Vector2::new(p[0], p[1]) - center) + center
    }

    /// Displacement field predicted by the mapping: `T(x) − x`.
    pub fn displacement(&self, x: Vector2) -> Vector2 {
        self.apply(x) - x
    }

    /// Log-likelihood of an alternate parameter set under this mapping's
    /// parameter distribution: `−½ · δᵀ Σ⁻¹ δ` with `δ = mu − p`.
    ///
    /// Parameters with infinite variance are unconstrained: their delta is
    /// zeroed and their row/column replaced by an identity block, so they
    /// contribute nothing while keeping the solve well-posed. The peak value
    /// at `p == mu` is exactly zero.
    pub fn log_likelihood(&self, p: &MapParams) -> Result<f64, AlignError> {
        let mut delta = self.mu - p;
        let mut sigma = self.sigma;

        for i in 0..7 {
            if sigma[(i, i)].is_infinite() {
                delta[i] = 0.0;
                for j in 0..7 {
                    sigma[(i, j)] = 0.0;
                    sigma[(j, i)] = 0.0;
                }
                sigma[(i, i)] = 1.0;
            }
        }

        let x = sigma
            .lu()
            .solve(&delta)
            .ok_or(AlignError::SingularCovariance)?;
        Ok(-0.5 * delta.dot(&x))
    }

    /// Draw `n` parameter vectors from the mapping's distribution.
    ///
    /// Fails with [`AlignError::UnboundedSample`] when the covariance has
    /// non-finite entries: a distribution with unconstrained parameters has
    /// no samplable density.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<MapParams>, AlignError> {
        if self.sigma.iter().any(|v| !v.is_finite()) {
            return Err(AlignError::UnboundedSample);
        }
        let chol = Cholesky::new(self.sigma).ok_or(AlignError::NotPositiveDefinite)?;
        let l = chol.l();

        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let z = MapParams::from_fn(|_, _| rng.sample(StandardNormal));
            out.push(self.mu + &l * z);
        }
        Ok(out)
    }

    /// Fit the seven mapping parameters to matched tie objects.
    ///
    /// Minimizes the summed squared mapping error `Σ |T(aᵢ) − bᵢ|²` with the
    /// Nelder–Mead simplex, seeded from the mean pair displacement. When a
    /// prior mapping is configured, its negative log-likelihood is added to
    /// the objective, turning the least-squares fit into a MAP estimate.
    pub fn fit(
        a: &[BivariateGaussian],
        b: &[BivariateGaussian],
        config: &FitConfig,
    ) -> Result<FrameMap, AlignError> {
        if a.len() != b.len() {
            return Err(AlignError::FrameMismatch {
                len_a: a.len(),
                len_b: b.len(),
            });
        }
        if a.is_empty() {
            return Err(AlignError::NoTieObjects);
        }

        // Seed: mean displacement for the shift, centroid of frame 1 for the
        // rotation center, no rotation, unit scales.
        let n = a.len() as f64;
        let mut shift0 = Vector2::zeros();
        let mut center0 = Vector2::zeros();
        for (ai, bi) in a.iter().zip(b) {
            shift0 += bi.mean() - ai.mean();
            center0 += ai.mean();
        }
        shift0 /= n;
        center0 /= n;
        let seed = [shift0.x, shift0.y, 0.0, center0.x, center0.y, 1.0, 1.0];

        let objective = |raw: &[f64]| {
            let params = MapParams::from_column_slice(raw);
            let mut cost = 0.0;
            for (ai, bi) in a.iter().zip(b) {
                cost += (Self::apply_params(&params, ai.mean()) - bi.mean()).norm_squared();
            }
            if let Some(prior) = &config.prior {
                match prior.log_likelihood(&params) {
                    Ok(ll) => cost -= 2.0 * ll,
                    Err(_) => return f64::INFINITY,
                }
            }
            cost
        };

        let result = minimize(objective, &seed, &config.minimizer);
        if !result.converged {
            warn!(
                "background fit did not converge after {} iterations (cost {:.3e})",
                result.iterations, result.fval,
            );
        }
        debug!(
            "background fit: dx=({:.4}, {:.4}), theta={:.3e}, d0=({:.2}, {:.2}), L=({:.6}, {:.6}), cost={:.3e}",
            result.x[0], result.x[1], result.x[2], result.x[3], result.x[4], result.x[5],
            result.x[6], result.fval,
        );

        Ok(FrameMap::new(
            Vector2::new(result.x[0], result.x[1]),
            result.x[2],
            Vector2::new(result.x[3], result.x[4]),
            Vector2::new(result.x[5], result.x[6]),
        ))
    }
}

/// Configuration for [`FrameMap::fit`].
#[derive(Debug, Clone, Default)]
pub struct FitConfig {
    /// Optional prior on the parameters; its negative log-likelihood is
    /// added to the least-squares objective.
    pub prior: Option<FrameMap>,
    /// Minimizer tolerances and iteration bound.
    pub minimizer: MinimizeConfig,
}
