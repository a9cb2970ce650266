//! Derivative-free scalar minimization.
//!
//! The hyperparameter search and the background-mapping fit both need only a
//! "minimize this objective from this starting point" capability over a
//! handful of parameters, so the classic Nelder–Mead simplex method is
//! implemented here directly instead of pulling in a solver stack.
//!
//! Non-finite objective values are treated as arbitrarily bad: the simplex
//! backs away from invalid regions (non-PSD trial covariances, negative
//! length-scales) instead of aborting.

/// Convergence and iteration controls for [`minimize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizeConfig {
    /// Absolute tolerance on the simplex spread in parameter space.
    pub x_tol: f64,
    /// Absolute tolerance on the objective-value spread across the simplex.
    pub f_tol: f64,
    /// Hard iteration bound; 0 means `200 · dimension`.
    pub max_iterations: usize,
}

impl Default for MinimizeConfig {
    fn default() -> Self {
        Self {
            x_tol: 1.0e-2,
            f_tol: 1.0e-6,
            max_iterations: 0,
        }
    }
}

/// Outcome of a simplex minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeResult {
    /// Best parameter vector found.
    pub x: Vec<f64>,
    /// Objective value at `x`.
    pub fval: f64,
    /// Iterations performed.
    pub iterations: usize,
    /// Whether both tolerances were met within the iteration bound. A
    /// `false` here is reported, never silently upgraded.
    pub converged: bool,
}

/// Minimize `f` from `x0` with the Nelder–Mead simplex method.
pub fn minimize<F>(mut f: F, x0: &[f64], config: &MinimizeConfig) -> MinimizeResult
where
    F: FnMut(&[f64]) -> f64,
{
    const ALPHA: f64 = 1.0; // reflection
    const GAMMA: f64 = 2.0; // expansion
    const RHO: f64 = 0.5; // contraction
    const SIGMA: f64 = 0.5; // shrink

    let n = x0.len();
    let max_iterations = if config.max_iterations == 0 {
        200 * n.max(1)
    } else {
        config.max_iterations
    };

    // Initial simplex: perturb each coordinate by 5%, or by a small
    // absolute step for coordinates at zero.
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(x0.to_vec());
    for i in 0..n {
        let mut v = x0.to_vec();
        v[i] = if v[i] != 0.0 { 1.05 * v[i] } else { 0.00025 };
        simplex.push(v);
    }
    let mut fvals: Vec<f64> = simplex.iter().map(|v| sanitize(f(v))).collect();

    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        sort_simplex(&mut simplex, &mut fvals);

        if spread_x(&simplex) <= config.x_tol && spread_f(&fvals) <= config.f_tol {
            converged = true;
            break;
        }
        iterations += 1;

        // Centroid of all vertices but the worst
        let mut centroid = vec![0.0; n];
        for v in &simplex[..n] {
            for (c, &vi) in centroid.iter_mut().zip(v) {
                *c += vi / n as f64;
            }
        }

        let worst = simplex[n].clone();
        let reflected: Vec<f64> = centroid
            .iter()
            .zip(&worst)
            .map(|(&c, &w)| c + ALPHA * (c - w))
            .collect();
        let f_reflected = sanitize(f(&reflected));

        if f_reflected < fvals[0] {
            // Best so far: try expanding further along the same direction
            let expanded: Vec<f64> = centroid
                .iter()
                .zip(&reflected)
                .map(|(&c, &r)| c + GAMMA * (r - c))
                .collect();
            let f_expanded = sanitize(f(&expanded));
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                fvals[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                fvals[n] = f_reflected;
            }
        } else if f_reflected < fvals[n - 1] {
            simplex[n] = reflected;
            fvals[n] = f_reflected;
        } else {
            // Contract toward the better of the worst vertex and its
            // reflection; shrink the whole simplex if that fails too
            let (toward, f_toward) = if f_reflected < fvals[n] {
                (&reflected, f_reflected)
            } else {
                (&worst, fvals[n])
            };
            let contracted: Vec<f64> = centroid
                .iter()
                .zip(toward)
                .map(|(&c, &t)| c + RHO * (t - c))
                .collect();
            let f_contracted = sanitize(f(&contracted));

            if f_contracted < f_toward {
                simplex[n] = contracted;
                fvals[n] = f_contracted;
            } else {
                let best = simplex[0].clone();
                for (v, fv) in simplex.iter_mut().zip(fvals.iter_mut()).skip(1) {
                    for (vi, &bi) in v.iter_mut().zip(&best) {
                        *vi = bi + SIGMA * (*vi - bi);
                    }
                    *fv = sanitize(f(v));
                }
            }
        }
    }

    sort_simplex(&mut simplex, &mut fvals);
    MinimizeResult {
        x: simplex.swap_remove(0),
        fval: fvals[0],
        iterations,
        converged,
    }
}

fn sanitize(v: f64) -> f64 {
    if v.is_nan() {
        f64::INFINITY
    } else {
        v
    }
}

fn sort_simplex(simplex: &mut [Vec<f64>], fvals: &mut [f64]) {
    let mut order: Vec<usize> = (0..fvals.len()).collect();
    order.sort_by(|&i, &j| fvals[i].partial_cmp(&fvals[j]).unwrap_or(std::cmp::Ordering::Equal));

    let sorted_simplex: Vec<Vec<f64>> = order.iter().map(|&i| simplex[i].clone()).collect();
    let sorted_fvals: Vec<f64> = order.iter().map(|&i| fvals[i]).collect();
    for (dst, src) in simplex.iter_mut().zip(sorted_simplex) {
        *dst = src;
    }
    fvals.copy_from_slice(&sorted_fvals);
}

/// Largest coordinate deviation of any vertex from the best vertex.
fn spread_x(simplex: &[Vec<f64>]) -> f64 {
    let best = &simplex[0];
    simplex[1..]
        .iter()
        .flat_map(|v| v.iter().zip(best).map(|(&vi, &bi)| (vi - bi).abs()))
        .fold(0.0, f64::max)
}

/// Largest objective deviation from the best vertex.
fn spread_f(fvals: &[f64]) -> f64 {
    fvals[1..]
        .iter()
        .map(|&v| (v - fvals[0]).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> MinimizeConfig {
        MinimizeConfig {
            x_tol: 1e-7,
            f_tol: 1e-12,
            max_iterations: 2000,
        }
    }

    #[test]
    fn test_quadratic_bowl() {
        let result = minimize(
            |x| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 2.0).powi(2),
            &[0.0, 0.0],
            &tight(),
        );
        assert!(result.converged);
        assert!(
            (result.x[0] - 3.0).abs() < 1e-4 && (result.x[1] + 2.0).abs() < 1e-4,
            "minimum at {:?}",
            result.x,
        );
        assert!(result.fval < 1e-8);
    }

    #[test]
    fn test_rosenbrock() {
        let result = minimize(
            |x| {
                let a = 1.0 - x[0];
                let b = x[1] - x[0] * x[0];
                a * a + 100.0 * b * b
            },
            &[-1.2, 1.0],
            &tight(),
        );
        assert!(result.converged, "ran {} iterations", result.iterations);
        assert!(
            (result.x[0] - 1.0).abs() < 1e-2 && (result.x[1] - 1.0).abs() < 1e-2,
            "minimum at {:?}",
            result.x,
        );
    }

    #[test]
    fn test_backs_away_from_invalid_region() {
        // Objective undefined for x < 0; the minimum sits at x = 1
        let result = minimize(
            |x| {
                if x[0] < 0.0 {
                    f64::NAN
                } else {
                    (x[0] - 1.0).powi(2)
                }
            },
            &[0.5],
            &tight(),
        );
        assert!(result.converged);
        assert!((result.x[0] - 1.0).abs() < 1e-4, "minimum at {:?}", result.x);
    }

    #[test]
    fn test_non_convergence_reported() {
        let result = minimize(
            |x| (x[0] - 3.0).powi(2),
            &[100.0],
            &MinimizeConfig {
                x_tol: 1e-12,
                f_tol: 1e-12,
                max_iterations: 3,
            },
        );
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
    }
}
