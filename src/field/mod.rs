//! Gaussian-process distortion field over matched tie objects.
//!
//! A [`DistortionField`] couples a background [`FrameMap`] (the GP mean
//! function) with a [`MaternKernel`] (the GP covariance) over the tie-object
//! locations. The observed data are the residual displacements left after
//! subtracting the background mapping; the GP turns them into a smooth,
//! spatially-correlated distortion model that can be queried — with
//! propagated uncertainty — at any location.
//!
//! # State machine
//!
//! A fresh field is **unfactorized**: it knows its locations, residual
//! nugget, and default hyperparameters, but holds no covariance factor.
//! [`build_covariance`](DistortionField::build_covariance) evaluates the
//! data covariance (kernel plus per-point measurement nugget) and caches its
//! Cholesky factor, moving the field to the **factorized** state that
//! [`regress`](DistortionField::regress) and
//! [`realization`](DistortionField::realization) require. Every
//! hyperparameter change goes through a fresh factorization, so the cached
//! factor can never disagree with the current hyperparameters.
//! [`condition`](DistortionField::condition) re-estimates the
//! hyperparameters by maximum likelihood and rebuilds.
//!
//! All covariance solves run through the cached Cholesky factor (two
//! triangular back-substitutions); no explicit matrix inverse is ever
//! formed. A covariance that fails to factorize is a fatal data or
//! configuration error, surfaced as
//! [`AlignError::NotPositiveDefinite`] rather than regularized away.

pub mod kernel;
pub mod optimize;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, warn};

use crate::error::AlignError;
use crate::gaussian::{BivariateGaussian, CovarianceSpec};
use crate::mapping::FrameMap;
use crate::{Matrix2, Vector2};
use kernel::{squared_distances, AmplitudeSpec, MaternKernel};
use optimize::{minimize, MinimizeConfig};

/// Kernel length-scale of a fresh field, in frame coordinate units.
const DEFAULT_SCALE: f64 = 100.0;
/// Isotropic kernel amplitude of a fresh field.
const DEFAULT_AMPLITUDE: f64 = 100.0;

/// Query input for [`DistortionField::regress`].
///
/// Bare coordinates are treated as zero-uncertainty points; query
/// distributions contribute their own positional uncertainty through the
/// background transform.
#[derive(Debug, Clone)]
pub enum RegressionInput<'a> {
    /// A single bare coordinate.
    Point(Vector2),
    /// A list of bare coordinates.
    Points(&'a [Vector2]),
    /// Query distributions with their own positional uncertainty.
    Distributions(&'a [BivariateGaussian]),
}

/// Which hyperparameters [`DistortionField::condition`] searches over.
///
/// The cross-component amplitude term is never part of the search; it stays
/// at its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamSubset {
    /// Length-scale and diagonal amplitude together.
    #[default]
    ScaleAndAmplitude,
    /// Length-scale only.
    ScaleOnly,
    /// Diagonal amplitude only.
    AmplitudeOnly,
}

/// Configuration for [`DistortionField::condition`].
#[derive(Debug, Clone, Default)]
pub struct ConditionConfig {
    pub subset: ParamSubset,
    pub minimizer: MinimizeConfig,
}

/// Outcome of a hyperparameter search.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    /// Conditioned kernel length-scale.
    pub scale: f64,
    /// Conditioned diagonal kernel amplitude.
    pub amplitude: f64,
    /// Final GP negative log-likelihood (summed over both axes).
    pub objective: f64,
    /// Minimizer iterations performed.
    pub iterations: usize,
    /// Whether the minimizer met its tolerances.
    pub converged: bool,
}

/// Observed tie-pair displacements with their measurement variances, for
/// external display layers.
#[derive(Debug, Clone, PartialEq)]
pub struct TieDisplacements {
    /// Frame-1 location of each pair.
    pub centers: Vec<Vector2>,
    /// Observed displacement of each pair.
    pub vectors: Vec<Vector2>,
    /// Summed per-axis measurement variances of each pair.
    pub variances: Vec<Vector2>,
}

/// GP regression engine over the residual distortion of matched tie objects.
#[derive(Debug, Clone)]
pub struct DistortionField {
    frame_a: Vec<BivariateGaussian>,
    frame_b: Vec<BivariateGaussian>,
    map: FrameMap,
    kernel: MaternKernel,
    /// Frame-1 observation mesh.
    mesh: Vec<Vector2>,
    /// Cached pairwise squared distances over the mesh.
    sq_dist: DMatrix<f64>,
    /// Per-pair measurement covariance sums (frame 1 + frame 2).
    nugget: Vec<Matrix2>,
    /// Cholesky factor of the data covariance; `None` until built.
    factor: Option<Cholesky<f64, Dyn>>,
}

impl DistortionField {
    /// Create a field over matched tie-object lists and a background
    /// mapping. Hyperparameters start at the crate defaults; no covariance
    /// is factorized yet.
    pub fn new(
        frame_a: Vec<BivariateGaussian>,
        frame_b: Vec<BivariateGaussian>,
        map: FrameMap,
    ) -> Result<Self, AlignError> {
        if frame_a.len() != frame_b.len() {
            return Err(AlignError::FrameMismatch {
                len_a: frame_a.len(),
                len_b: frame_b.len(),
            });
        }
        if frame_a.is_empty() {
            return Err(AlignError::NoTieObjects);
        }

        let mesh: Vec<Vector2> = frame_a.iter().map(|o| o.mean()).collect();
        let sq_dist = squared_distances(&mesh, &mesh);
        let nugget: Vec<Matrix2> = frame_a
            .iter()
            .zip(&frame_b)
            .map(|(ai, bi)| ai.covariance() + bi.covariance())
            .collect();
        let kernel = MaternKernel::new(DEFAULT_SCALE, AmplitudeSpec::Scalar(DEFAULT_AMPLITUDE))?;

        Ok(Self {
            frame_a,
            frame_b,
            map,
            kernel,
            mesh,
            sq_dist,
            nugget,
            factor: None,
        })
    }

    pub fn map(&self) -> &FrameMap {
        &self.map
    }

    pub fn kernel(&self) -> &MaternKernel {
        &self.kernel
    }

    /// Number of tie-object pairs.
    pub fn num_ties(&self) -> usize {
        self.mesh.len()
    }

    /// Whether the data covariance has been built and factorized.
    pub fn is_factorized(&self) -> bool {
        self.factor.is_some()
    }

    /// Residual displacements after subtracting the background mapping:
    /// `rᵢ = (bᵢ − aᵢ) − D(bᵢ)`, with `D` the mapping's predicted
    /// displacement evaluated at the frame-2 location. Returned per axis.
    pub fn residuals(&self) -> (DVector<f64>, DVector<f64>) {
        let n = self.mesh.len();
        let mut dx = DVector::zeros(n);
        let mut dy = DVector::zeros(n);
        for i in 0..n {
            let a = self.frame_a[i].mean();
            let b = self.frame_b[i].mean();
            let r = (b - a) - self.map.displacement(b);
            dx[i] = r.x;
            dy[i] = r.y;
        }
        (dx, dy)
    }

    /// Rebuild the data covariance `C = amplitude·k(d²) + nugget` and its
    /// Cholesky factor with updated hyperparameters. `None` keeps the
    /// current value of a hyperparameter.
    ///
    /// The previous factor is discarded up front: a failed build leaves the
    /// field unfactorized rather than paired with a stale factor.
    pub fn build_covariance(
        &mut self,
        scale: Option<f64>,
        amp: Option<AmplitudeSpec>,
    ) -> Result<(), AlignError> {
        self.factor = None;

        let scale = scale.unwrap_or_else(|| self.kernel.scale());
        let amp_matrix = match amp {
            Some(spec) => spec.into_matrix()?,
            None => *self.kernel.amplitude(),
        };
        self.kernel = MaternKernel::new(scale, AmplitudeSpec::Full(amp_matrix))?;

        let c = self.kernel.evaluate(&self.sq_dist, Some(&self.nugget));
        self.factor = Some(Cholesky::new(c).ok_or(AlignError::NotPositiveDefinite)?);
        Ok(())
    }

    /// Condition the kernel hyperparameters on the observed residuals by
    /// maximum likelihood, then rebuild the covariance with the winner.
    ///
    /// The objective is the GP negative log-likelihood summed over the x and
    /// y axes, each evaluated through its own Cholesky factor. Raw optimizer
    /// iterates are squared before use, so the search is positivity-safe
    /// regardless of sign. Deterministic for a given dataset and start.
    pub fn condition(&mut self, config: &ConditionConfig) -> Result<Conditioning, AlignError> {
        let (dx, dy) = self.residuals();
        let nugget_x: Vec<f64> = self.nugget.iter().map(|v| v[(0, 0)]).collect();
        let nugget_y: Vec<f64> = self.nugget.iter().map(|v| v[(1, 1)]).collect();

        let scale0 = self.kernel.scale();
        let amp0 = self.kernel.amplitude()[(0, 0)];
        let amp_cross = self.kernel.amplitude()[(0, 1)];

        let decode = |raw: &[f64]| -> (f64, f64) {
            match config.subset {
                ParamSubset::ScaleAndAmplitude => (raw[0] * raw[0], raw[1] * raw[1]),
                ParamSubset::ScaleOnly => (raw[0] * raw[0], amp0),
                ParamSubset::AmplitudeOnly => (scale0, raw[0] * raw[0]),
            }
        };

        // Start the search at the current hyperparameters
        let x0: Vec<f64> = match config.subset {
            ParamSubset::ScaleAndAmplitude => vec![scale0.sqrt(), amp0.sqrt()],
            ParamSubset::ScaleOnly => vec![scale0.sqrt()],
            ParamSubset::AmplitudeOnly => vec![amp0.sqrt()],
        };

        let sq_dist = &self.sq_dist;
        let objective = |raw: &[f64]| {
            let (scale, amp_diag) = decode(raw);
            if scale <= 0.0 {
                return f64::INFINITY;
            }
            let kernel = match MaternKernel::new(
                scale,
                AmplitudeSpec::Symmetric {
                    diag: amp_diag,
                    cross: amp_cross,
                },
            ) {
                Ok(k) => k,
                Err(_) => return f64::INFINITY,
            };
            axis_neg_log_likelihood(&kernel, sq_dist, &dx, &nugget_x, 0)
                + axis_neg_log_likelihood(&kernel, sq_dist, &dy, &nugget_y, 1)
        };

        let result = minimize(objective, &x0, &config.minimizer);
        if !result.converged {
            warn!(
                "hyperparameter search did not converge after {} iterations (objective {:.3e})",
                result.iterations, result.fval,
            );
        }

        let (scale, amplitude) = decode(&result.x);
        self.build_covariance(
            Some(scale),
            Some(AmplitudeSpec::Symmetric {
                diag: amplitude,
                cross: amp_cross,
            }),
        )?;
        debug!(
            "conditioned GP: scale={:.4}, amplitude={:.4}, objective={:.6e}, {} iterations",
            scale, amplitude, result.fval, result.iterations,
        );

        Ok(Conditioning {
            scale,
            amplitude,
            objective: result.fval,
            iterations: result.iterations,
            converged: result.converged,
        })
    }

    /// GP regression at new locations.
    ///
    /// Each output combines the background-transformed query (mean and
    /// covariance) with the GP posterior over the residual field: posterior
    /// mean `Cs·C⁻¹·r` added to the transformed mean, and the 2×2 diagonal
    /// block of `Css − Cs·C⁻¹·Csᵀ` added to the transformed covariance. No
    /// nugget enters the query covariances: positional input uncertainty is
    /// already carried through the background transform. Output is
    /// index-aligned with the query.
    ///
    /// Requires a factorized field; fails with
    /// [`AlignError::CovarianceNotBuilt`] otherwise.
    pub fn regress(&self, input: RegressionInput<'_>) -> Result<Vec<BivariateGaussian>, AlignError> {
        let queries: Vec<BivariateGaussian> = match input {
            RegressionInput::Point(p) => vec![BivariateGaussian::point(p)],
            RegressionInput::Points(ps) => {
                ps.iter().map(|&p| BivariateGaussian::point(p)).collect()
            }
            RegressionInput::Distributions(ds) => ds.to_vec(),
        };
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let locs: Vec<Vector2> = queries.iter().map(|q| q.mean()).collect();
        let (post_mean, post_cov) = self.posterior(&locs)?;

        let mut out = Vec::with_capacity(queries.len());
        for (i, q) in queries.iter().enumerate() {
            let t = q.transform(&self.map);
            let mean = t.mean + Vector2::new(post_mean[2 * i], post_mean[2 * i + 1]);
            let cov = t.cov + posterior_block(&post_cov, i);
            out.push(BivariateGaussian::new(mean, CovarianceSpec::Full(cov))?);
        }
        Ok(out)
    }

    /// Background mean displacement evaluated at arbitrary locations.
    pub fn mean_displacements(&self, points: &[Vector2]) -> Vec<Vector2> {
        points.iter().map(|&p| self.map.displacement(p)).collect()
    }

    /// Observed displacement of each tie pair together with its summed
    /// per-axis measurement variances.
    pub fn tie_displacements(&self) -> TieDisplacements {
        let n = self.mesh.len();
        let mut centers = Vec::with_capacity(n);
        let mut vectors = Vec::with_capacity(n);
        let mut variances = Vec::with_capacity(n);
        for i in 0..n {
            centers.push(self.frame_a[i].mean());
            vectors.push(self.frame_b[i].mean() - self.frame_a[i].mean());
            variances.push(Vector2::new(self.nugget[i][(0, 0)], self.nugget[i][(1, 1)]));
        }
        TieDisplacements {
            centers,
            vectors,
            variances,
        }
    }

    /// Draw one realization of the displacement field at `points` from the
    /// GP prior, ignoring the observed residuals.
    pub fn prior_realization<R: Rng + ?Sized>(
        &self,
        points: &[Vector2],
        rng: &mut R,
    ) -> Result<Vec<Vector2>, AlignError> {
        let prior = self
            .kernel
            .evaluate(&squared_distances(points, points), None);
        let factor = Cholesky::new(prior).ok_or(AlignError::NotPositiveDefinite)?;
        let draw = factor.l() * standard_normal_vector(2 * points.len(), rng);
        Ok(points
            .iter()
            .enumerate()
            .map(|(i, &p)| self.map.displacement(p) + Vector2::new(draw[2 * i], draw[2 * i + 1]))
            .collect())
    }

    /// Draw one realization of the displacement field at `points` from the
    /// GP posterior conditioned on the observed residuals.
    ///
    /// Requires a factorized field. The joint posterior covariance over the
    /// query points must itself be positive-definite; querying exactly at
    /// noise-free observations makes it singular, which is surfaced as
    /// [`AlignError::NotPositiveDefinite`].
    pub fn realization<R: Rng + ?Sized>(
        &self,
        points: &[Vector2],
        rng: &mut R,
    ) -> Result<Vec<Vector2>, AlignError> {
        let (post_mean, post_cov) = self.posterior(points)?;
        let factor = Cholesky::new(post_cov).ok_or(AlignError::NotPositiveDefinite)?;
        let draw = post_mean + factor.l() * standard_normal_vector(2 * points.len(), rng);
        Ok(points
            .iter()
            .enumerate()
            .map(|(i, &p)| self.map.displacement(p) + Vector2::new(draw[2 * i], draw[2 * i + 1]))
            .collect())
    }

    /// Joint GP posterior (mean vector and covariance, interleaved x/y) of
    /// the residual field at the given locations.
    fn posterior(&self, locs: &[Vector2]) -> Result<(DVector<f64>, DMatrix<f64>), AlignError> {
        let factor = self.factor.as_ref().ok_or(AlignError::CovarianceNotBuilt)?;

        let (dx, dy) = self.residuals();
        let n = self.mesh.len();
        let mut r = DVector::zeros(2 * n);
        for i in 0..n {
            r[2 * i] = dx[i];
            r[2 * i + 1] = dy[i];
        }

        let cs = self
            .kernel
            .evaluate(&squared_distances(locs, &self.mesh), None);
        let css = self.kernel.evaluate(&squared_distances(locs, locs), None);

        let mean = &cs * factor.solve(&r);
        let cov = &css - &cs * factor.solve(&cs.transpose());
        Ok((mean, cov))
    }
}

/// GP negative log-likelihood of one residual axis: the quadratic form via
/// two triangular solves through the Cholesky factor, plus the 2π-weighted
/// log-determinant read off the factor diagonal. A trial covariance that
/// fails to factorize scores as infinitely bad.
fn axis_neg_log_likelihood(
    kernel: &MaternKernel,
    sq_dist: &DMatrix<f64>,
    residual: &DVector<f64>,
    nugget: &[f64],
    axis: usize,
) -> f64 {
    let c = kernel.evaluate_axis(sq_dist, axis, Some(nugget));
    let Some(factor) = Cholesky::new(c) else {
        return f64::INFINITY;
    };
    let quad = residual.dot(&factor.solve(residual));
    let log_det: f64 = factor.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
    quad + 2.0 * std::f64::consts::PI * log_det
}

/// The `i`-th 2×2 diagonal block of a posterior covariance, symmetrized.
/// Diagonal entries that went negative by no more than factorization-level
/// float noise are floored at zero, so exact interpolation stays
/// representable; genuinely negative variances are left to fail downstream.
fn posterior_block(s: &DMatrix<f64>, i: usize) -> Matrix2 {
    let floor = -1e-9 * s.amax().max(1.0);
    let off = 0.5 * (s[(2 * i, 2 * i + 1)] + s[(2 * i + 1, 2 * i)]);
    let mut vx = s[(2 * i, 2 * i)];
    let mut vy = s[(2 * i + 1, 2 * i + 1)];
    if vx < 0.0 && vx >= floor {
        vx = 0.0;
    }
    if vy < 0.0 && vy >= floor {
        vy = 0.0;
    }
    Matrix2::new(vx, off, off, vy)
}

fn standard_normal_vector<R: Rng + ?Sized>(len: usize, rng: &mut R) -> DVector<f64> {
    DVector::from_fn(len, |_, _| rng.sample(StandardNormal))
}

/// Regular `res`×`res` grid over the bounding box of `points`, row-major.
/// A convenience for display layers that evaluate the field on a mesh.
pub fn grid(points: &[Vector2], res: usize) -> Vec<Vector2> {
    if points.is_empty() || res == 0 {
        return Vec::new();
    }
    let mut min = points[0];
    let mut max = points[0];
    for p in points {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    let steps = res.saturating_sub(1).max(1) as f64;
    let mut out = Vec::with_capacity(res * res);
    for iy in 0..res {
        for ix in 0..res {
            out.push(Vector2::new(
                min.x + (max.x - min.x) * ix as f64 / steps,
                min.y + (max.y - min.y) * iy as f64 / steps,
            ));
        }
    }
    out
}
