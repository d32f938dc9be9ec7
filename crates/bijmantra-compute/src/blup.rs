//! Best linear unbiased prediction through the mixed-model equations.

use serde::{Deserialize, Serialize};

use crate::error::{check_finite, check_len, ComputeError, Result};
use crate::mme::MixedModelData;
use crate::solver::{invert_spd, CholeskyFactor, SolverConfig, SolverKind};

/// Solution of one BLUP solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlupSolution {
    /// Fixed effects (p)
    pub beta: Vec<f64>,
    /// Random effects / breeding values (q)
    pub u: Vec<f64>,
    /// `Xβ + Zu` (n)
    pub fitted: Vec<f64>,
    /// `y − Xβ − Zu` (n)
    pub residuals: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// Prediction error variance `σe²·C^uu_ii` of each random effect (direct
    /// solver only)
    pub pev: Option<Vec<f64>>,
    /// `1 − PEV_i / (σa²·A_ii)`, clipped to `[0, 1]` (direct solver only)
    pub reliability: Option<Vec<f64>>,
}

/// `σe²/σa²`, rejecting non-positive variances and non-finite ratios.
pub fn variance_ratio(var_a: f64, var_e: f64) -> Result<f64> {
    let invalid = ComputeError::InvalidVarianceRatio { var_a, var_e };
    if !(var_a > 0.0) || !(var_e > 0.0) {
        return Err(invalid);
    }
    let ratio = var_e / var_a;
    if !ratio.is_finite() {
        return Err(invalid);
    }
    Ok(ratio)
}

/// Solve the MME and write `β` and `u` into the caller's buffers.
///
/// The incoming contents of `beta` and `u` are used as the starting guess
/// for iterative solvers; non-finite contents are ignored. Returns the solver
/// iteration count.
///
/// Inputs are fully validated before anything is written. On
/// [`ComputeError::NonConvergence`] or [`ComputeError::SingularSystem`] the
/// buffers hold the solver's last iterate.
pub fn blup_into(
    data: &MixedModelData<'_>,
    ainv: &[f64],
    var_a: f64,
    var_e: f64,
    solver: &SolverConfig,
    beta: &mut [f64],
    u: &mut [f64],
) -> Result<usize> {
    data.validate()?;
    check_len("inverse relationship matrix", ainv, data.q * data.q)?;
    check_len("beta", beta, data.p)?;
    check_len("u", u, data.q)?;
    let ratio = variance_ratio(var_a, var_e)?;
    let system = data.assemble(ainv, ratio)?;

    let dim = system.dim();
    let mut x: Vec<f64> = beta.iter().chain(u.iter()).copied().collect();
    let result = solver
        .solver_for(dim)
        .solve(&system.c, &system.rhs, &mut x, dim);

    match result {
        Ok(iterations) => log::debug!("BLUP solved (dim {}) in {} iterations", dim, iterations),
        Err(ref e) if e.is_numerical() => log::warn!("BLUP solve did not finish cleanly: {}", e),
        Err(e) => return Err(e),
    }
    beta.copy_from_slice(&x[..data.p]);
    u.copy_from_slice(&x[data.p..]);
    result
}

/// Owned variant of [`blup_into`] that also reports fitted values and
/// residuals. Solver non-convergence is reported as `converged = false`.
///
/// When the configuration resolves to the direct solver, the factorisation
/// is reused for prediction error variances and reliabilities.
pub fn blup(
    data: &MixedModelData<'_>,
    ainv: &[f64],
    var_a: f64,
    var_e: f64,
    solver: &SolverConfig,
) -> Result<BlupSolution> {
    let (p, q) = (data.p, data.q);
    let mut beta = vec![0.0; p];
    let mut u = vec![0.0; q];
    let mut pev = None;
    let mut reliability = None;

    let (iterations, converged) = if solver.resolve(data.dim()) == SolverKind::Cholesky && data.dim() > 0 {
        data.validate()?;
        check_len("inverse relationship matrix", ainv, q * q)?;
        let ratio = variance_ratio(var_a, var_e)?;
        let system = data.assemble(ainv, ratio)?;
        let factor = CholeskyFactor::factorize(&system.c, system.dim(), solver.pivot_threshold)?;
        let sol = factor.solve(&system.rhs);
        beta.copy_from_slice(&sol[..p]);
        u.copy_from_slice(&sol[p..]);

        let cinv = factor.inverse();
        let errors: Vec<f64> = (0..q).map(|i| var_e * cinv[(p + i, p + i)]).collect();
        reliability = relationship_diagonal(ainv, q, solver.pivot_threshold).map(|a_diag| {
            errors
                .iter()
                .zip(&a_diag)
                .map(|(pe, a)| (1.0 - pe / (var_a * a)).clamp(0.0, 1.0))
                .collect()
        });
        pev = Some(errors);
        log::debug!("BLUP solved directly (dim {})", system.dim());
        (1, true)
    } else {
        match blup_into(data, ainv, var_a, var_e, solver, &mut beta, &mut u) {
            Ok(iterations) => (iterations, true),
            Err(ComputeError::NonConvergence { iterations, .. }) => (iterations, false),
            Err(e) => return Err(e),
        }
    };

    let fitted = data.fitted_unchecked(&beta, &u);
    let residuals = data.residuals_unchecked(&beta, &u);
    Ok(BlupSolution {
        beta,
        u,
        fitted,
        residuals,
        iterations,
        converged,
        pev,
        reliability,
    })
}

/// Diagonal of `A` recovered from `A⁻¹`, `None` if it cannot be inverted.
fn relationship_diagonal(ainv: &[f64], q: usize, pivot_threshold: f64) -> Option<Vec<f64>> {
    let mut sym = vec![0.0; q * q];
    for i in 0..q {
        for j in 0..q {
            sym[i * q + j] = 0.5 * (ainv[i * q + j] + ainv[j * q + i]);
        }
    }
    match invert_spd(&sym, q, pivot_threshold) {
        Ok(a) => Some((0..q).map(|i| a[i * q + i]).collect()),
        Err(e) => {
            log::warn!("reliabilities skipped: {}", e);
            None
        }
    }
}

/// Simplified GEBV: `gebv_i = y_i · h²`.
///
/// This is a shrinkage approximation, not a model fit; the genotypes only
/// have their dimensions checked. Use [`crate::genomic::gblup`] for GBLUP
/// through the mixed-model equations.
pub fn compute_gblup(
    genotypes: &[f64],
    phenotypes: &[f64],
    n: usize,
    m: usize,
    heritability: f64,
    gebv: &mut [f64],
) -> Result<()> {
    check_len("genotypes", genotypes, n * m)?;
    check_len("phenotypes", phenotypes, n)?;
    check_len("gebv", gebv, n)?;
    if !(0.0..=1.0).contains(&heritability) {
        return Err(ComputeError::InvalidHeritability(heritability));
    }
    check_finite("phenotypes", phenotypes)?;
    for (g, y) in gebv.iter_mut().zip(phenotypes) {
        *g = y * heritability;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mme::identity;
    use approx::assert_relative_eq;

    const Y: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
    const X: [f64; 4] = [1.0; 4];

    fn config(kind: SolverKind) -> SolverConfig {
        SolverConfig {
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_blup_intercept_identity() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        for kind in [SolverKind::Cholesky, SolverKind::ConjugateGradient] {
            let sol = blup(&data, &identity(4), 1.0, 1.0, &config(kind)).unwrap();
            assert!(sol.converged);
            assert_relative_eq!(sol.beta[0], 2.5, epsilon = 1e-8);
            let expected = [-0.75, -0.25, 0.25, 0.75];
            for (u, e) in sol.u.iter().zip(expected.iter()) {
                assert_relative_eq!(*u, *e, epsilon = 1e-8);
            }
            assert_relative_eq!(sol.u.iter().sum::<f64>(), 0.0, epsilon = 1e-8);
            for i in 0..4 {
                assert_relative_eq!(sol.fitted[i] + sol.residuals[i], Y[i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_direct_solve_reports_pev_and_reliability() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        let sol = blup(&data, &identity(4), 1.0, 1.0, &config(SolverKind::Cholesky)).unwrap();
        // C^uu = (2I - J/4)⁻¹ = ½(I + J/4), diagonal 0.625
        let pev = sol.pev.unwrap();
        let rel = sol.reliability.unwrap();
        for i in 0..4 {
            assert_relative_eq!(pev[i], 0.625, epsilon = 1e-12);
            assert_relative_eq!(rel[i], 0.375, epsilon = 1e-12);
        }

        let iterative = blup(&data, &identity(4), 1.0, 1.0, &config(SolverKind::ConjugateGradient)).unwrap();
        assert!(iterative.pev.is_none() && iterative.reliability.is_none());
    }

    #[test]
    fn test_reliability_grows_with_genetic_variance() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        let cfg = config(SolverKind::Cholesky);
        let low = blup(&data, &identity(4), 0.2, 1.0, &cfg).unwrap().reliability.unwrap();
        let high = blup(&data, &identity(4), 5.0, 1.0, &cfg).unwrap().reliability.unwrap();
        for (l, h) in low.iter().zip(&high) {
            assert!(*l < *h);
            assert!((0.0..=1.0).contains(l) && (0.0..=1.0).contains(h));
        }
    }

    #[test]
    fn test_small_genetic_variance_shrinks_u() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        let sol = blup(&data, &identity(4), 1e-9, 1.0, &config(SolverKind::Cholesky)).unwrap();
        assert!(sol.u.iter().all(|u| u.abs() < 1e-6));
        assert_relative_eq!(sol.beta[0], 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_variances_rejected() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        let mut beta = [9.0];
        let mut u = [9.0; 4];
        let cfg = SolverConfig::default();
        for (va, ve) in [(0.0, 1.0), (1.0, 0.0), (-1.0, 1.0), (f64::NAN, 1.0), (1e-320, 1e300)] {
            let err = blup_into(&data, &identity(4), va, ve, &cfg, &mut beta, &mut u).unwrap_err();
            assert!(matches!(err, ComputeError::InvalidVarianceRatio { .. }));
        }
        assert_eq!(beta, [9.0]);
        assert_eq!(u, [9.0; 4]);
    }

    #[test]
    fn test_dimension_mismatch_before_write() {
        let z = identity(4);
        let x2 = [1.0; 8];
        let data = MixedModelData { y: &Y, x: &x2, z: &z, n: 4, p: 3, q: 4 };
        let mut beta = [7.0; 3];
        let mut u = [7.0; 4];
        let err = blup_into(&data, &identity(4), 1.0, 1.0, &SolverConfig::default(), &mut beta, &mut u)
            .unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { .. }));
        assert_eq!(beta, [7.0; 3]);
        assert_eq!(u, [7.0; 4]);
    }

    #[test]
    fn test_resolve_from_solution_takes_no_iterations() {
        let z = identity(4);
        let data = MixedModelData::new(&Y, &X, &z, 4, 1, 4).unwrap();
        let cfg = config(SolverKind::ConjugateGradient);
        let mut beta = [0.0];
        let mut u = [0.0; 4];
        blup_into(&data, &identity(4), 1.0, 1.0, &cfg, &mut beta, &mut u).unwrap();
        let again = blup_into(&data, &identity(4), 1.0, 1.0, &cfg, &mut beta, &mut u).unwrap();
        assert!(again <= 1);
    }

    #[test]
    fn test_simplified_gblup() {
        let geno = [0.0; 8];
        let mut gebv = [0.0; 4];
        compute_gblup(&geno, &Y, 4, 2, 0.5, &mut gebv).unwrap();
        assert_eq!(gebv, [0.5, 1.0, 1.5, 2.0]);

        compute_gblup(&geno, &Y, 4, 2, 1.0, &mut gebv).unwrap();
        assert_eq!(gebv, Y);

        let err = compute_gblup(&geno, &Y, 4, 2, 1.5, &mut gebv).unwrap_err();
        assert_eq!(err, ComputeError::InvalidHeritability(1.5));
        let err = compute_gblup(&geno[..7], &Y, 4, 2, 0.5, &mut gebv).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { .. }));
    }
}
