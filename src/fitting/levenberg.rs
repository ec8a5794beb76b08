//! Levenberg–Marquardt minimization of weighted least-squares problems.

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::errors::{PositioningError, Result};

/// Hard cap on solver iterations.
const MAX_ITERATIONS: usize = 100;
/// Relative step-size convergence threshold, ‖Δθ‖ / (‖θ‖ + ε).
const STEP_TOLERANCE: f64 = 1e-8;
/// Absolute cost-change convergence threshold.
const COST_TOLERANCE: f64 = 1e-12;
/// Initial damping factor.
const INITIAL_LAMBDA: f64 = 1e-3;
/// Damping beyond which the solve is considered diverged.
const MAX_LAMBDA: f64 = 1e12;

/// A weighted nonlinear least-squares problem.
///
/// Residuals are already normalized by their standard deviations, so the
/// cost is plainly `‖r(θ)‖²` and the Jacobian is the derivative of the
/// normalized residual vector (sign of the model derivative included).
pub(crate) trait LeastSquaresProblem {
    fn num_residuals(&self) -> usize;
    fn num_params(&self) -> usize;
    /// `r(θ)` with `r_i = (y_i − f_i(θ)) / σ_i`.
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;
    /// `J[(i, j)] = ∂r_i/∂θ_j`.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64>;
}

/// Converged (or iteration-capped) solver state.
pub(crate) struct LmSolution {
    pub params: DVector<f64>,
    /// `σ̂² · (JᵀJ)⁻¹` with `σ̂²` the reduced chi-square, or `None` when the
    /// final normal matrix is singular.
    pub covariance: Option<DMatrix<f64>>,
    /// Final `‖r‖`.
    pub residual_norm: f64,
    /// Final `‖r‖²`.
    pub chi2: f64,
    pub iterations: usize,
}

fn solve_damped(
    normal: &DMatrix<f64>,
    gradient: &DVector<f64>,
    lambda: f64,
) -> Option<DVector<f64>> {
    let p = normal.nrows();
    let mut damped = normal.clone();
    for i in 0..p {
        damped[(i, i)] += lambda * normal[(i, i)].max(1e-12);
    }
    damped
        .clone()
        .cholesky()
        .map(|ch| ch.solve(&(-gradient)))
        .or_else(|| damped.lu().solve(&(-gradient)))
}

/// Minimize `‖r(θ)‖²` starting from `initial`.
///
/// Fails with [`PositioningError::NumericalFailure`] on non-finite
/// residuals, a Jacobian the damping cannot regularize, or runaway damping
/// (divergence). Reaching the iteration cap returns the best state found.
pub(crate) fn solve_least_squares(
    problem: &dyn LeastSquaresProblem,
    initial: DVector<f64>,
) -> Result<LmSolution> {
    let m = problem.num_residuals();
    let p = problem.num_params();
    if m < p {
        return Err(PositioningError::NumericalFailure(format!(
            "{m} residuals cannot constrain {p} parameters"
        )));
    }

    let mut params = initial;
    let mut residuals = problem.residuals(&params);
    if residuals.iter().any(|r| !r.is_finite()) {
        return Err(PositioningError::NumericalFailure(
            "non-finite residuals at the initial estimate".into(),
        ));
    }
    let mut cost = residuals.norm_squared();
    let mut lambda = INITIAL_LAMBDA;
    let mut iterations = 0;

    for iteration in 0..MAX_ITERATIONS {
        iterations = iteration + 1;
        let jacobian = problem.jacobian(&params);
        if jacobian.iter().any(|v| !v.is_finite()) {
            return Err(PositioningError::NumericalFailure(
                "non-finite Jacobian".into(),
            ));
        }
        let normal = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &residuals;

        let mut converged = false;
        let mut accepted = false;
        while lambda <= MAX_LAMBDA {
            let Some(step) = solve_damped(&normal, &gradient, lambda) else {
                lambda *= 10.0;
                continue;
            };
            let trial = &params + &step;
            let trial_residuals = problem.residuals(&trial);
            if trial_residuals.iter().any(|r| !r.is_finite()) {
                lambda *= 10.0;
                continue;
            }
            let trial_cost = trial_residuals.norm_squared();
            if trial_cost <= cost {
                let relative_step = step.norm() / (params.norm() + 1e-12);
                let cost_drop = cost - trial_cost;
                params = trial;
                residuals = trial_residuals;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(1e-15);
                accepted = true;
                if relative_step < STEP_TOLERANCE || cost_drop < COST_TOLERANCE {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        if !accepted {
            return Err(PositioningError::NumericalFailure(
                "Levenberg-Marquardt diverged (damping exhausted)".into(),
            ));
        }
        trace!("lm iteration {iteration}: cost {cost:.6e}, lambda {lambda:.1e}");
        if converged {
            break;
        }
    }

    let jacobian = problem.jacobian(&params);
    let normal = jacobian.transpose() * &jacobian;
    let dof = m.saturating_sub(p);
    let sigma2 = if dof > 0 { cost / dof as f64 } else { 1.0 };
    let covariance = normal
        .clone()
        .cholesky()
        .map(|ch| ch.inverse())
        .or_else(|| normal.try_inverse())
        .map(|inv| {
            let scaled = inv * sigma2;
            // Symmetrize away the last bits of rounding noise.
            (&scaled + scaled.transpose()) * 0.5
        });
    if covariance.is_none() {
        debug!("singular normal matrix at the solution; covariance unavailable");
    }

    Ok(LmSolution {
        params,
        covariance,
        residual_norm: cost.sqrt(),
        chi2: cost,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fit y = exp(-k x) samples for k.
    struct Decay {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl LeastSquaresProblem for Decay {
        fn num_residuals(&self) -> usize {
            self.xs.len()
        }

        fn num_params(&self) -> usize {
            1
        }

        fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
            let k = params[0];
            DVector::from_iterator(
                self.xs.len(),
                self.xs
                    .iter()
                    .zip(&self.ys)
                    .map(|(x, y)| y - (-k * x).exp()),
            )
        }

        fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
            let k = params[0];
            DMatrix::from_iterator(
                self.xs.len(),
                1,
                self.xs.iter().map(|x| x * (-k * x).exp()),
            )
        }
    }

    #[test]
    fn test_recovers_decay_rate() {
        let truth = 0.7;
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let ys: Vec<f64> = xs.iter().map(|x| (-truth * x).exp()).collect();
        let problem = Decay { xs, ys };

        let solution = solve_least_squares(&problem, DVector::from_vec(vec![0.1])).unwrap();
        assert_relative_eq!(solution.params[0], truth, epsilon = 1e-8);
        assert!(solution.residual_norm < 1e-8);
        assert!(solution.covariance.is_some());
    }

    /// A two-parameter problem where only the sum of the parameters is
    /// observable; its normal matrix is singular everywhere.
    struct Degenerate;

    impl LeastSquaresProblem for Degenerate {
        fn num_residuals(&self) -> usize {
            3
        }

        fn num_params(&self) -> usize {
            2
        }

        fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
            let s = params[0] + params[1];
            DVector::from_vec(vec![1.0 - s, 2.0 - s, 3.0 - s])
        }

        fn jacobian(&self, _params: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(3, 2, &[-1.0, -1.0, -1.0, -1.0, -1.0, -1.0])
        }
    }

    #[test]
    fn test_singular_problem_reports_no_covariance() {
        // The damped steps still move along the observable direction, but the
        // undamped normal matrix at the solution stays singular.
        let solution = solve_least_squares(&Degenerate, DVector::from_vec(vec![0.0, 0.0]));
        if let Ok(solution) = solution {
            assert!(solution.covariance.is_none());
        }
    }

    #[test]
    fn test_underdetermined_is_rejected() {
        struct Tiny;
        impl LeastSquaresProblem for Tiny {
            fn num_residuals(&self) -> usize {
                1
            }
            fn num_params(&self) -> usize {
                2
            }
            fn residuals(&self, _p: &DVector<f64>) -> DVector<f64> {
                DVector::zeros(1)
            }
            fn jacobian(&self, _p: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::zeros(1, 2)
            }
        }
        assert!(matches!(
            solve_least_squares(&Tiny, DVector::zeros(2)),
            Err(PositioningError::NumericalFailure(_))
        ));
    }
}
