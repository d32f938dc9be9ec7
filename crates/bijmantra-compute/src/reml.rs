//! REML estimation of additive genetic and residual variance.
//!
//! Model: `y = Xβ + Zu + e`, `u ~ N(0, A·σa²)`, `e ~ N(0, I·σe²)`.
//!
//! Every iteration assembles the MME with `α = σe²/σa²`, factorises it by
//! Cholesky, evaluates the restricted log-likelihood at the current
//! variances and then updates them with either the EM or the
//! average-information (AI) rule. The coefficient matrix is always factorised
//! directly because the likelihood needs `ln|C|` and the updates need
//! `tr(A⁻¹C^uu)`.
//!
//! With the unscaled coefficient matrix `C = W'W + diag(0, α·A⁻¹)`:
//!
//! ```text
//! logL = -½[(n-p)·ln2π + (n-p-q)·ln σe² + q·ln σa² + ln|A| + ln|C| + y'ê/σe²]
//! ```
//!
//! # References
//!
//! - Henderson, C.R. (1973). Sire evaluation and genetic trends.
//! - Gilmour, A.R., Thompson, R. & Cullis, B.R. (1995). Average information
//!   REML. Biometrics 51:1440-1450.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{check_finite, check_len, ComputeError, Result};
use crate::mme::MixedModelData;
use crate::solver::CholeskyFactor;

/// Step-halving attempts before an AI step is abandoned for an EM step.
const MAX_STEP_HALVINGS: usize = 10;

/// Variance update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemlMethod {
    /// Expectation-maximisation; slow but never decreases the likelihood.
    #[default]
    Em,
    /// Newton steps with the average-information matrix.
    AverageInformation,
}

/// Options for [`reml`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemlConfig {
    pub method: RemlMethod,
    pub max_iter: usize,
    /// Relative change in both variances, or in the log-likelihood, at which
    /// the iteration stops.
    pub tolerance: f64,
    /// Smallest value either variance may take.
    pub variance_floor: f64,
    /// EM iterations run before AI updates start.
    pub em_burn_in: usize,
    pub pivot_threshold: f64,
}

impl Default for RemlConfig {
    fn default() -> Self {
        Self {
            method: RemlMethod::Em,
            max_iter: 100,
            tolerance: 1e-6,
            variance_floor: 1e-6,
            em_burn_in: 3,
            pivot_threshold: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceComponent {
    Genetic,
    Residual,
}

/// Non-fatal events recorded during estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemlWarning {
    /// An update fell to or below the floor and was replaced by it.
    VarianceClamped {
        iteration: usize,
        component: VarianceComponent,
        proposed: f64,
    },
}

/// Likelihood and variances at the start of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RemlIteration {
    pub iteration: usize,
    pub log_likelihood: f64,
    pub var_a: f64,
    pub var_e: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemlResult {
    pub var_a: f64,
    pub var_e: f64,
    /// `σa² / (σa² + σe²)`
    pub heritability: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Restricted log-likelihood at the returned variances.
    pub log_likelihood: f64,
    pub beta: Vec<f64>,
    pub u: Vec<f64>,
    pub history: Vec<RemlIteration>,
    pub warnings: Vec<RemlWarning>,
}

/// Quantities needed by the updates, all at one `(σa², σe²)`.
struct Evaluation {
    log_likelihood: f64,
    beta: Vec<f64>,
    u: Vec<f64>,
    residuals: Vec<f64>,
    /// `tr(A⁻¹ C^uu)`
    trace: f64,
    /// `û'A⁻¹û`
    u_ainv_u: f64,
    factor: CholeskyFactor,
}

struct Problem<'a> {
    data: &'a MixedModelData<'a>,
    ainv: Vec<f64>,
    log_det_a: f64,
    pivot_threshold: f64,
}

impl<'a> Problem<'a> {
    fn new(data: &'a MixedModelData<'a>, a: &[f64], pivot_threshold: f64) -> Result<Self> {
        let q = data.q;
        let a_factor = CholeskyFactor::factorize(a, q, pivot_threshold)?;
        let inv = a_factor.inverse();
        let mut ainv = vec![0.0; q * q];
        for i in 0..q {
            for j in 0..q {
                ainv[i * q + j] = inv[(i, j)];
            }
        }
        Ok(Self {
            data,
            ainv,
            log_det_a: a_factor.log_determinant(),
            pivot_threshold,
        })
    }

    fn evaluate(&self, var_a: f64, var_e: f64) -> Result<Evaluation> {
        let data = self.data;
        let (n, p, q) = (data.n, data.p, data.q);
        let ratio = var_e / var_a;

        let system = data.assemble(&self.ainv, ratio)?;
        let factor = CholeskyFactor::factorize(&system.c, system.dim(), self.pivot_threshold)?;
        let sol = factor.solve(&system.rhs);
        let beta = sol[..p].to_vec();
        let u = sol[p..].to_vec();
        let residuals = data.residuals_unchecked(&beta, &u);

        let y_e: f64 = data.y.iter().zip(&residuals).map(|(a, b)| a * b).sum();
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let log_likelihood = -0.5
            * ((n - p) as f64 * ln_2pi
                + (n as f64 - p as f64 - q as f64) * var_e.ln()
                + q as f64 * var_a.ln()
                + self.log_det_a
                + factor.log_determinant()
                + y_e / var_e);

        let cinv = factor.inverse();
        let mut trace = 0.0;
        let mut u_ainv_u = 0.0;
        for i in 0..q {
            for j in 0..q {
                let aij = self.ainv[i * q + j];
                trace += aij * cinv[(p + j, p + i)];
                u_ainv_u += u[i] * aij * u[j];
            }
        }

        Ok(Evaluation {
            log_likelihood,
            beta,
            u,
            residuals,
            trace,
            u_ainv_u,
            factor,
        })
    }

    fn em_update(&self, ev: &Evaluation, var_a: f64, var_e: f64) -> (f64, f64) {
        let (n, p, q) = (self.data.n as f64, self.data.p as f64, self.data.q as f64);
        let ratio = var_e / var_a;
        let e_e: f64 = ev.residuals.iter().map(|e| e * e).sum();
        let new_a = (ev.u_ainv_u + var_e * ev.trace) / q;
        let new_e = (e_e + var_e * (p + q - ratio * ev.trace)) / n;
        (new_a, new_e)
    }

    /// Newton step with the average-information matrix, `None` when the AI
    /// matrix is not invertible or no halving keeps both variances positive.
    fn ai_update(&self, ev: &Evaluation, var_a: f64, var_e: f64) -> Option<(f64, f64)> {
        let data = self.data;
        let (n, p, q) = (data.n as f64, data.p as f64, data.q as f64);
        let ratio = var_e / var_a;

        // Working variates: ZAZ'Py = Zû/σa², Py = ê/σe²
        let zu = data.fitted_unchecked(&vec![0.0; data.p], &ev.u);
        let w_a: Vec<f64> = zu.iter().map(|v| v / var_a).collect();
        let w_e: Vec<f64> = ev.residuals.iter().map(|v| v / var_e).collect();

        let wt_a = data.transpose_times(&w_a);
        let wt_e = data.transpose_times(&w_e);
        let c_a = ev.factor.solve(&wt_a);
        let c_e = ev.factor.solve(&wt_e);

        let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
        // ½ w_i'P w_j with P = (I - W C⁻¹ W') / σe²
        let ai_aa = 0.5 * (dot(&w_a, &w_a) - dot(&wt_a, &c_a)) / var_e;
        let ai_ae = 0.5 * (dot(&w_a, &w_e) - dot(&wt_a, &c_e)) / var_e;
        let ai_ee = 0.5 * (dot(&w_e, &w_e) - dot(&wt_e, &c_e)) / var_e;

        let e_e: f64 = ev.residuals.iter().map(|e| e * e).sum();
        let score_a = -0.5 * ((q - ratio * ev.trace) / var_a - ev.u_ainv_u / (var_a * var_a));
        let score_e = -0.5 * ((n - p - q + ratio * ev.trace) / var_e - e_e / (var_e * var_e));

        let ai = DMatrix::from_row_slice(2, 2, &[ai_aa, ai_ae, ai_ae, ai_ee]);
        let det = ai.determinant();
        let magnitude = ai_aa.abs().max(ai_ee.abs());
        // Near-singular AI (e.g. û ≈ 0) gives unbounded Newton steps.
        if !(det > f64::EPSILON * magnitude * magnitude) || !det.is_finite() {
            return None;
        }
        let ai_inv = ai.try_inverse()?;
        let step_a = ai_inv[(0, 0)] * score_a + ai_inv[(0, 1)] * score_e;
        let step_e = ai_inv[(1, 0)] * score_a + ai_inv[(1, 1)] * score_e;

        let mut scale = 1.0;
        for _ in 0..=MAX_STEP_HALVINGS {
            let cand_a = var_a + scale * step_a;
            let cand_e = var_e + scale * step_e;
            if cand_a > 0.0 && cand_e > 0.0 && cand_a.is_finite() && cand_e.is_finite() {
                return Some((cand_a, cand_e));
            }
            scale *= 0.5;
        }
        None
    }
}

fn validate(data: &MixedModelData<'_>, a: &[f64], init_var_a: f64, init_var_e: f64) -> Result<()> {
    data.validate()?;
    check_len("relationship matrix", a, data.q * data.q)?;
    check_finite("relationship matrix", a)?;
    if data.n <= data.p {
        return Err(ComputeError::DegenerateInput(format!(
            "REML needs more records ({}) than fixed effects ({})",
            data.n, data.p
        )));
    }
    if data.q == 0 {
        return Err(ComputeError::DegenerateInput("no random effects".into()));
    }
    if !(init_var_a > 0.0 && init_var_e > 0.0 && init_var_a.is_finite() && init_var_e.is_finite()) {
        return Err(ComputeError::InvalidVarianceRatio {
            var_a: init_var_a,
            var_e: init_var_e,
        });
    }
    Ok(())
}

fn clamp(
    value: f64,
    floor: f64,
    iteration: usize,
    component: VarianceComponent,
    warnings: &mut Vec<RemlWarning>,
) -> f64 {
    if value > floor && value.is_finite() {
        return value;
    }
    log::warn!(
        "REML iteration {}: {:?} variance update {:.3e} clamped to {:.3e}",
        iteration,
        component,
        value,
        floor
    );
    warnings.push(RemlWarning::VarianceClamped {
        iteration,
        component,
        proposed: value,
    });
    floor
}

fn relative_change(old: f64, new: f64) -> f64 {
    (new - old).abs() / old.abs().max(f64::MIN_POSITIVE)
}

/// Restricted log-likelihood at fixed variances.
pub fn log_likelihood(data: &MixedModelData<'_>, a: &[f64], var_a: f64, var_e: f64) -> Result<f64> {
    validate(data, a, var_a, var_e)?;
    let problem = Problem::new(data, a, RemlConfig::default().pivot_threshold)?;
    Ok(problem.evaluate(var_a, var_e)?.log_likelihood)
}

/// Estimate `σa²` and `σe²` by REML starting from the given values.
///
/// `a` is the `q × q` relationship matrix (not its inverse). Running out of
/// iterations is not an error: the result carries `converged = false` and the
/// last estimates.
pub fn reml(
    data: &MixedModelData<'_>,
    a: &[f64],
    init_var_a: f64,
    init_var_e: f64,
    config: &RemlConfig,
) -> Result<RemlResult> {
    validate(data, a, init_var_a, init_var_e)?;
    let problem = Problem::new(data, a, config.pivot_threshold)?;

    let floor = config.variance_floor;
    let mut warnings = Vec::new();
    let mut history = Vec::new();
    let mut var_a = clamp(init_var_a, floor, 0, VarianceComponent::Genetic, &mut warnings);
    let mut var_e = clamp(init_var_e, floor, 0, VarianceComponent::Residual, &mut warnings);

    let mut converged = false;
    let mut iterations = 0;
    let mut prev_logl: Option<f64> = None;
    // Evaluation and the variances it was computed at.
    let mut last: Option<(Evaluation, f64, f64)> = None;

    for iteration in 1..=config.max_iter {
        iterations = iteration;
        let ev = problem.evaluate(var_a, var_e)?;
        let logl = ev.log_likelihood;
        history.push(RemlIteration {
            iteration,
            log_likelihood: logl,
            var_a,
            var_e,
        });
        log::debug!(
            "REML iteration {}: logL = {:.6}, var_a = {:.6}, var_e = {:.6}",
            iteration,
            logl,
            var_a,
            var_e
        );

        if let Some(prev) = prev_logl {
            if relative_change(prev, logl) < config.tolerance {
                converged = true;
                last = Some((ev, var_a, var_e));
                break;
            }
        }
        prev_logl = Some(logl);

        let use_ai = config.method == RemlMethod::AverageInformation && iteration > config.em_burn_in;
        let (new_a, new_e) = if use_ai {
            problem
                .ai_update(&ev, var_a, var_e)
                .unwrap_or_else(|| {
                    log::debug!("REML iteration {}: AI step rejected, using EM", iteration);
                    problem.em_update(&ev, var_a, var_e)
                })
        } else {
            problem.em_update(&ev, var_a, var_e)
        };
        let new_a = clamp(new_a, floor, iteration, VarianceComponent::Genetic, &mut warnings);
        let new_e = clamp(new_e, floor, iteration, VarianceComponent::Residual, &mut warnings);

        let small_step =
            relative_change(var_a, new_a) < config.tolerance && relative_change(var_e, new_e) < config.tolerance;
        last = Some((ev, var_a, var_e));
        var_a = new_a;
        var_e = new_e;
        if small_step {
            converged = true;
            break;
        }
    }

    let final_ev = match last {
        Some((ev, a_at, e_at)) if a_at == var_a && e_at == var_e => ev,
        _ => problem.evaluate(var_a, var_e)?,
    };

    if !converged {
        log::warn!(
            "REML did not converge in {} iterations (var_a = {:.6}, var_e = {:.6})",
            config.max_iter,
            var_a,
            var_e
        );
    }

    Ok(RemlResult {
        var_a,
        var_e,
        heritability: var_a / (var_a + var_e),
        iterations,
        converged,
        log_likelihood: final_ev.log_likelihood,
        beta: final_ev.beta,
        u: final_ev.u,
        history,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mme::identity;
    use approx::assert_relative_eq;

    // Two groups of two records, intercept only.
    #[rustfmt::skip]
    const Z: [f64; 8] = [
        1.0, 0.0,
        1.0, 0.0,
        0.0, 1.0,
        0.0, 1.0,
    ];
    const X: [f64; 4] = [1.0; 4];

    /// logL computed from V = σa²·ZAZ' + σe²·I directly.
    fn direct_log_likelihood(y: &[f64], x: &[f64], z: &[f64], a: &[f64], n: usize, p: usize, q: usize, va: f64, ve: f64) -> f64 {
        let y = DMatrix::from_row_slice(n, 1, y);
        let x = DMatrix::from_row_slice(n, p, x);
        let z = DMatrix::from_row_slice(n, q, z);
        let a = DMatrix::from_row_slice(q, q, a);
        let v = &z * &a * z.transpose() * va + DMatrix::identity(n, n) * ve;
        let vinv = v.clone().try_inverse().unwrap();
        let xvx = x.transpose() * &vinv * &x;
        let xvx_inv = xvx.clone().try_inverse().unwrap();
        let pm = &vinv - &vinv * &x * xvx_inv * x.transpose() * &vinv;
        let ypy = (y.transpose() * pm * &y)[(0, 0)];
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        -0.5 * ((n - p) as f64 * ln_2pi + v.determinant().ln() + xvx.determinant().ln() + ypy)
    }

    #[test]
    fn test_log_likelihood_matches_direct_formula() {
        let y = [1.0, 2.5, 4.0, 3.2];
        #[rustfmt::skip]
        let a = [
            1.0, 0.25,
            0.25, 1.1,
        ];
        let data = MixedModelData::new(&y, &X, &Z, 4, 1, 2).unwrap();
        for (va, ve) in [(1.0, 1.0), (0.3, 2.0), (4.0, 0.5)] {
            let got = log_likelihood(&data, &a, va, ve).unwrap();
            let expected = direct_log_likelihood(&y, &X, &Z, &a, 4, 1, 2, va, ve);
            assert_relative_eq!(got, expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_em_first_update_hand_computed() {
        // Equal group means: û = 0, t = 4/3 at σa² = σe² = 1.
        let y = [1.0, 3.0, 1.0, 3.0];
        let data = MixedModelData::new(&y, &X, &Z, 4, 1, 2).unwrap();
        let config = RemlConfig {
            max_iter: 1,
            ..Default::default()
        };
        let result = reml(&data, &identity(2), 1.0, 1.0, &config).unwrap();
        assert_eq!(result.iterations, 1);
        assert!(!result.converged);
        assert_relative_eq!(result.var_a, 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(result.var_e, (4.0 + 3.0 - 4.0 / 3.0) / 4.0, epsilon = 1e-12);
        assert_eq!(result.history.len(), 1);
    }

    #[test]
    fn test_clamped_variance_is_reported() {
        let y = [1.0, 3.0, 1.0, 3.0];
        let data = MixedModelData::new(&y, &X, &Z, 4, 1, 2).unwrap();
        let config = RemlConfig {
            max_iter: 20,
            variance_floor: 0.6,
            ..Default::default()
        };
        let result = reml(&data, &identity(2), 1.0, 1.0, &config).unwrap();
        assert!(result.var_a >= 0.6);
        assert!(result.var_e >= 0.6);
        assert!(result.warnings.iter().any(|w| matches!(
            w,
            RemlWarning::VarianceClamped { component: VarianceComponent::Genetic, .. }
        )));
    }

    #[test]
    fn test_ai_clamps_at_boundary_without_group_signal() {
        // Identical group means: the REML optimum for var_a lies at zero.
        #[rustfmt::skip]
        let y = [
            1.0, 2.0, 3.0,
            3.0, 1.0, 2.0,
            2.0, 3.0, 1.0,
        ];
        let (n, q) = (9, 3);
        let mut z = vec![0.0; n * q];
        for r in 0..n {
            z[r * q + r / 3] = 1.0;
        }
        let x = vec![1.0; n];
        let data = MixedModelData::new(&y, &x, &z, n, 1, q).unwrap();
        let config = RemlConfig {
            method: RemlMethod::AverageInformation,
            em_burn_in: 0,
            variance_floor: 0.05,
            tolerance: 1e-12,
            max_iter: 60,
            ..Default::default()
        };
        let result = reml(&data, &identity(q), 1.0, 1.0, &config).unwrap();

        assert!(result.var_a >= 0.05);
        assert!(result.var_e > 0.0 && result.var_e.is_finite());
        assert!(result.warnings.iter().any(|w| matches!(
            w,
            RemlWarning::VarianceClamped { component: VarianceComponent::Genetic, .. }
        )));
        assert!(result.history.iter().all(|h| h.var_a >= 0.05 && h.var_e > 0.0));
        assert!(result.log_likelihood.is_finite());
    }

    #[test]
    fn test_zero_iterations_evaluates_start() {
        let y = [1.0, 2.5, 4.0, 3.2];
        let data = MixedModelData::new(&y, &X, &Z, 4, 1, 2).unwrap();
        let config = RemlConfig {
            max_iter: 0,
            ..Default::default()
        };
        let result = reml(&data, &identity(2), 1.0, 2.0, &config).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(!result.converged);
        assert_eq!((result.var_a, result.var_e), (1.0, 2.0));
        let expected = log_likelihood(&data, &identity(2), 1.0, 2.0).unwrap();
        assert_relative_eq!(result.log_likelihood, expected);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let y = [1.0, 2.5, 4.0, 3.2];
        let data = MixedModelData::new(&y, &X, &Z, 4, 1, 2).unwrap();
        let cfg = RemlConfig::default();

        let err = reml(&data, &identity(2), 0.0, 1.0, &cfg).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidVarianceRatio { .. }));

        let err = reml(&data, &identity(3), 1.0, 1.0, &cfg).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { .. }));

        let singular = [1.0, 1.0, 1.0, 1.0];
        let err = reml(&data, &singular, 1.0, 1.0, &cfg).unwrap_err();
        assert!(matches!(err, ComputeError::SingularSystem { .. }));

        let x4 = identity(4);
        let wide = MixedModelData::new(&y, &x4, &Z, 4, 4, 2).unwrap();
        let err = reml(&wide, &identity(2), 1.0, 1.0, &cfg).unwrap_err();
        assert!(matches!(err, ComputeError::DegenerateInput(_)));

        let no_random = MixedModelData::new(&y, &X, &[], 4, 1, 0).unwrap();
        let err = reml(&no_random, &[], 1.0, 1.0, &cfg).unwrap_err();
        assert!(matches!(err, ComputeError::DegenerateInput(_)));
    }

    #[test]
    fn test_methods_reach_same_estimates() {
        #[rustfmt::skip]
        let y = [
            10.2, 11.1, 9.8,
            12.5, 13.0, 12.1,
            8.9, 9.4, 8.1,
            11.0, 10.1, 10.7,
            13.3, 12.2, 12.9,
        ];
        let q = 5;
        let n = 15;
        let mut z = vec![0.0; n * q];
        for r in 0..n {
            z[r * q + r / 3] = 1.0;
        }
        let x = vec![1.0; n];
        let data = MixedModelData::new(&y, &x, &z, n, 1, q).unwrap();

        let em = reml(&data, &identity(q), 1.0, 1.0, &RemlConfig {
            tolerance: 1e-12,
            max_iter: 5000,
            ..Default::default()
        })
        .unwrap();
        let ai = reml(&data, &identity(q), 1.0, 1.0, &RemlConfig {
            method: RemlMethod::AverageInformation,
            tolerance: 1e-12,
            max_iter: 200,
            ..Default::default()
        })
        .unwrap();

        assert!(em.converged);
        assert!(ai.converged);
        assert_relative_eq!(em.var_a, ai.var_a, max_relative = 1e-3);
        assert_relative_eq!(em.var_e, ai.var_e, max_relative = 1e-3);
        assert_relative_eq!(em.log_likelihood, ai.log_likelihood, max_relative = 1e-6);
    }
}
