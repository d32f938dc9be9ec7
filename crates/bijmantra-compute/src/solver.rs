//! Linear solvers for the symmetric systems produced by MME assembly.
//!
//! Two implementations sit behind [`LinearSolver`]: a Jacobi-preconditioned
//! conjugate gradient for large systems and a dense Cholesky factorisation for
//! small ones. Both report the number of iterations performed; the direct
//! solver always reports 1.
//!
//! Matrices are row-major `dim × dim` slices. The solution buffer doubles as
//! the starting guess for the iterative solver.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{check_finite, check_len, ComputeError, Result};

/// Dimension above which the matrix-vector product is spread over threads.
const PARALLEL_MATVEC_DIM: usize = 512;

/// Which solver to use for `C·x = rhs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Jacobi-preconditioned conjugate gradient.
    ConjugateGradient,
    /// Dense Cholesky factorisation.
    Cholesky,
    /// Cholesky up to `direct_threshold`, conjugate gradient beyond it.
    #[default]
    Auto,
}

/// Options for the linear solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub kind: SolverKind,
    /// Relative residual ‖rhs − C·x‖ / ‖rhs‖ at which CG stops.
    pub tolerance: f64,
    /// Iteration cap for CG.
    pub max_iter: usize,
    /// Pivots at or below `pivot_threshold × max(diag C)` count as singular.
    pub pivot_threshold: f64,
    /// Largest dimension handled by Cholesky under [`SolverKind::Auto`].
    pub direct_threshold: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            kind: SolverKind::Auto,
            tolerance: 1e-10,
            max_iter: 1000,
            pivot_threshold: 1e-12,
            direct_threshold: 2000,
        }
    }
}

impl SolverConfig {
    /// Resolve `Auto` against a concrete system size.
    pub fn resolve(&self, dim: usize) -> SolverKind {
        match self.kind {
            SolverKind::Auto if dim <= self.direct_threshold => SolverKind::Cholesky,
            SolverKind::Auto => SolverKind::ConjugateGradient,
            kind => kind,
        }
    }

    /// Build the solver this configuration selects for a system of size `dim`.
    pub fn solver_for(&self, dim: usize) -> Box<dyn LinearSolver> {
        match self.resolve(dim) {
            SolverKind::Cholesky => Box::new(CholeskySolver {
                pivot_threshold: self.pivot_threshold,
            }),
            _ => Box::new(ConjugateGradient {
                tolerance: self.tolerance,
                max_iter: self.max_iter,
                pivot_threshold: self.pivot_threshold,
            }),
        }
    }
}

/// Solve `C·x = rhs` in place.
pub trait LinearSolver {
    /// Writes the solution into `x` and returns the iterations performed.
    ///
    /// `x` is read as the starting point by iterative implementations. On
    /// [`ComputeError::NonConvergence`] it holds the last iterate.
    fn solve(&self, c: &[f64], rhs: &[f64], x: &mut [f64], dim: usize) -> Result<usize>;
}

/// Solve `C·x = rhs` with the solver selected by `config`.
pub fn solve(config: &SolverConfig, c: &[f64], rhs: &[f64], x: &mut [f64], dim: usize) -> Result<usize> {
    config.solver_for(dim).solve(c, rhs, x, dim)
}

fn validate_system(c: &[f64], rhs: &[f64], x: &[f64], dim: usize) -> Result<()> {
    check_len("coefficient matrix", c, dim * dim)?;
    check_len("right-hand side", rhs, dim)?;
    check_len("solution", x, dim)?;
    check_finite("coefficient matrix", c)?;
    check_finite("right-hand side", rhs)?;
    Ok(())
}

fn max_diagonal(c: &[f64], dim: usize) -> f64 {
    (0..dim).map(|i| c[i * dim + i]).fold(0.0, f64::max)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(c: &[f64], v: &[f64], out: &mut [f64], dim: usize) {
    if dim >= PARALLEL_MATVEC_DIM {
        out.par_iter_mut()
            .zip(c.par_chunks_exact(dim))
            .for_each(|(o, row)| *o = dot(row, v));
    } else {
        for (o, row) in out.iter_mut().zip(c.chunks_exact(dim)) {
            *o = dot(row, v);
        }
    }
}

/// Jacobi-preconditioned conjugate gradient.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    pub tolerance: f64,
    pub max_iter: usize,
    pub pivot_threshold: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        let cfg = SolverConfig::default();
        Self {
            tolerance: cfg.tolerance,
            max_iter: cfg.max_iter,
            pivot_threshold: cfg.pivot_threshold,
        }
    }
}

impl LinearSolver for ConjugateGradient {
    fn solve(&self, c: &[f64], rhs: &[f64], x: &mut [f64], dim: usize) -> Result<usize> {
        validate_system(c, rhs, x, dim)?;
        if dim == 0 {
            return Ok(0);
        }

        let max_diag = max_diagonal(c, dim);
        let floor = self.pivot_threshold * max_diag;
        let mut inv_diag = Vec::with_capacity(dim);
        for i in 0..dim {
            let d = c[i * dim + i];
            if d <= floor || d <= 0.0 {
                return Err(ComputeError::SingularSystem { pivot: i, value: d });
            }
            inv_diag.push(1.0 / d);
        }

        let b_norm = dot(rhs, rhs).sqrt();
        if b_norm == 0.0 {
            x.fill(0.0);
            return Ok(0);
        }
        if x.iter().any(|v| !v.is_finite()) {
            x.fill(0.0);
        }

        let mut q = vec![0.0; dim];
        mat_vec(c, x, &mut q, dim);
        let mut r: Vec<f64> = rhs.iter().zip(&q).map(|(b, cx)| b - cx).collect();
        let mut rel = dot(&r, &r).sqrt() / b_norm;
        if rel <= self.tolerance {
            return Ok(0);
        }

        let mut z: Vec<f64> = r.iter().zip(&inv_diag).map(|(ri, mi)| ri * mi).collect();
        let mut p = z.clone();
        let mut rz = dot(&r, &z);

        for iter in 1..=self.max_iter {
            mat_vec(c, &p, &mut q, dim);
            let pq = dot(&p, &q);
            let pp = dot(&p, &p);
            if pq <= floor * pp {
                return Err(ComputeError::SingularSystem {
                    pivot: iter - 1,
                    value: pq / pp,
                });
            }
            let alpha = rz / pq;
            for i in 0..dim {
                x[i] += alpha * p[i];
                r[i] -= alpha * q[i];
            }
            rel = dot(&r, &r).sqrt() / b_norm;
            log::trace!("cg iteration {}: relative residual {:.3e}", iter, rel);
            if rel <= self.tolerance {
                return Ok(iter);
            }

            for i in 0..dim {
                z[i] = r[i] * inv_diag[i];
            }
            let rz_next = dot(&r, &z);
            let beta = rz_next / rz;
            rz = rz_next;
            for i in 0..dim {
                p[i] = z[i] + beta * p[i];
            }
        }

        Err(ComputeError::NonConvergence {
            iterations: self.max_iter,
            relative_residual: rel,
        })
    }
}

/// Dense Cholesky solver. Always reports one iteration.
#[derive(Debug, Clone)]
pub struct CholeskySolver {
    pub pivot_threshold: f64,
}

impl Default for CholeskySolver {
    fn default() -> Self {
        Self {
            pivot_threshold: SolverConfig::default().pivot_threshold,
        }
    }
}

impl LinearSolver for CholeskySolver {
    fn solve(&self, c: &[f64], rhs: &[f64], x: &mut [f64], dim: usize) -> Result<usize> {
        validate_system(c, rhs, x, dim)?;
        if dim == 0 {
            return Ok(0);
        }
        let factor = CholeskyFactor::factorize(c, dim, self.pivot_threshold)?;
        factor.solve_into(rhs, x);
        Ok(1)
    }
}

/// A checked Cholesky factorisation `C = L·L'`.
///
/// Exposes the log-determinant, solves and the inverse, which REML needs on
/// top of the plain solution vector.
pub struct CholeskyFactor {
    chol: Cholesky<f64, Dyn>,
    dim: usize,
}

impl CholeskyFactor {
    /// Factorise a row-major symmetric matrix.
    pub fn factorize(c: &[f64], dim: usize, pivot_threshold: f64) -> Result<Self> {
        check_len("coefficient matrix", c, dim * dim)?;
        check_finite("coefficient matrix", c)?;
        let m = DMatrix::from_row_slice(dim, dim, c);
        Self::from_matrix(m, pivot_threshold)
    }

    /// Factorise an already-built symmetric matrix.
    pub fn from_matrix(m: DMatrix<f64>, pivot_threshold: f64) -> Result<Self> {
        let dim = m.nrows();
        let max_diag = (0..dim).map(|i| m[(i, i)]).fold(0.0, f64::max);
        let floor = pivot_threshold * max_diag;

        let chol = match m.clone().cholesky() {
            Some(chol) => chol,
            None => {
                let (pivot, value) = locate_failed_pivot(&m, floor);
                return Err(ComputeError::SingularSystem { pivot, value });
            }
        };

        let l = chol.l_dirty();
        for i in 0..dim {
            let pivot = l[(i, i)] * l[(i, i)];
            if pivot <= floor {
                return Err(ComputeError::SingularSystem { pivot: i, value: pivot });
            }
        }

        Ok(Self { chol, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// ln|C| = 2·Σ ln L_ii.
    pub fn log_determinant(&self) -> f64 {
        let l = self.chol.l_dirty();
        2.0 * (0..self.dim).map(|i| l[(i, i)].ln()).sum::<f64>()
    }

    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        let b = DVector::from_column_slice(rhs);
        self.chol.solve(&b).iter().copied().collect()
    }

    pub fn solve_into(&self, rhs: &[f64], x: &mut [f64]) {
        let b = DVector::from_column_slice(rhs);
        let sol = self.chol.solve(&b);
        x.copy_from_slice(sol.as_slice());
    }

    /// Full inverse, mirrored from the upper triangle so it is exactly symmetric.
    pub fn inverse(&self) -> DMatrix<f64> {
        let mut inv = self.chol.inverse();
        for i in 0..self.dim {
            for j in (i + 1)..self.dim {
                inv[(j, i)] = inv[(i, j)];
            }
        }
        inv
    }
}

/// Find the first pivot that breaks an unpivoted Cholesky pass.
fn locate_failed_pivot(m: &DMatrix<f64>, floor: f64) -> (usize, f64) {
    let n = m.nrows();
    let mut l = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let mut d = m[(j, j)];
        for k in 0..j {
            d -= l[(j, k)] * l[(j, k)];
        }
        if d <= floor || !d.is_finite() {
            return (j, d);
        }
        let ljj = d.sqrt();
        l[(j, j)] = ljj;
        for i in (j + 1)..n {
            let mut s = m[(i, j)];
            for k in 0..j {
                s -= l[(i, k)] * l[(j, k)];
            }
            l[(i, j)] = s / ljj;
        }
    }
    (n.saturating_sub(1), 0.0)
}

/// Invert a symmetric positive-definite row-major matrix.
pub fn invert_spd(a: &[f64], n: usize, pivot_threshold: f64) -> Result<Vec<f64>> {
    check_len("matrix", a, n * n)?;
    if n == 0 {
        return Ok(Vec::new());
    }
    let factor = CholeskyFactor::factorize(a, n, pivot_threshold)?;
    let inv = factor.inverse();
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            out[i * n + j] = inv[(i, j)];
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // 4x + y = 1, x + 3y = 2  =>  x = 1/11, y = 7/11
    const C2: [f64; 4] = [4.0, 1.0, 1.0, 3.0];
    const B2: [f64; 2] = [1.0, 2.0];

    #[test]
    fn test_cg_matches_analytic_two_by_two() {
        let mut x = [0.0; 2];
        let iters = ConjugateGradient::default().solve(&C2, &B2, &mut x, 2).unwrap();
        assert!(iters <= 2);
        assert_relative_eq!(x[0], 1.0 / 11.0, epsilon = 1e-9);
        assert_relative_eq!(x[1], 7.0 / 11.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cholesky_matches_analytic_two_by_two() {
        let mut x = [0.0; 2];
        let iters = CholeskySolver::default().solve(&C2, &B2, &mut x, 2).unwrap();
        assert_eq!(iters, 1);
        assert_relative_eq!(x[0], 1.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 7.0 / 11.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_system_is_a_no_op() {
        let mut x: [f64; 0] = [];
        assert_eq!(ConjugateGradient::default().solve(&[], &[], &mut x, 0), Ok(0));
        assert_eq!(CholeskySolver::default().solve(&[], &[], &mut x, 0), Ok(0));
    }

    #[test]
    #[rustfmt::skip]
    fn test_cg_exhausting_iterations_reports_best_effort() {
        let c = [
            10.0, 1.0, 0.0, 0.0,
            1.0, 8.0, 2.0, 0.0,
            0.0, 2.0, 6.0, 1.0,
            0.0, 0.0, 1.0, 3.0,
        ];
        let b = [1.0, -1.0, 2.0, 0.3];
        let cg = ConjugateGradient {
            tolerance: 1e-14,
            max_iter: 1,
            pivot_threshold: 1e-12,
        };
        let mut x = [0.0; 4];
        match cg.solve(&c, &b, &mut x, 4) {
            Err(ComputeError::NonConvergence { iterations, relative_residual }) => {
                assert_eq!(iterations, 1);
                assert!(relative_residual.is_finite() && relative_residual > 1e-14);
            }
            other => panic!("expected non-convergence, got {:?}", other),
        }
        assert!(x.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_singular_matrix_is_detected() {
        let c = [1.0, 1.0, 1.0, 1.0];
        let mut x = [0.0; 2];
        let err = CholeskySolver::default().solve(&c, &[1.0, 2.0], &mut x, 2).unwrap_err();
        assert!(matches!(err, ComputeError::SingularSystem { pivot: 1, .. }));
    }

    #[test]
    fn test_zero_diagonal_is_singular_for_cg() {
        let c = [1.0, 0.0, 0.0, 0.0];
        let mut x = [0.0; 2];
        let err = ConjugateGradient::default().solve(&c, &[1.0, 0.0], &mut x, 2).unwrap_err();
        assert!(matches!(err, ComputeError::SingularSystem { pivot: 1, .. }));
    }

    #[test]
    fn test_dimension_mismatch_leaves_solution_untouched() {
        let mut x = [7.0, 7.0];
        let err = solve(&SolverConfig::default(), &C2[..3], &B2, &mut x, 2).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { .. }));
        assert_eq!(x, [7.0, 7.0]);
    }

    #[test]
    fn test_auto_switches_on_dimension() {
        let cfg = SolverConfig {
            direct_threshold: 10,
            ..Default::default()
        };
        assert_eq!(cfg.resolve(10), SolverKind::Cholesky);
        assert_eq!(cfg.resolve(11), SolverKind::ConjugateGradient);
    }

    #[test]
    fn test_log_determinant_and_inverse() {
        let f = CholeskyFactor::factorize(&C2, 2, 1e-12).unwrap();
        assert_relative_eq!(f.log_determinant(), 11.0f64.ln(), epsilon = 1e-12);
        let inv = invert_spd(&C2, 2, 1e-12).unwrap();
        assert_relative_eq!(inv[0], 3.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(inv[1], -1.0 / 11.0, epsilon = 1e-12);
        assert_eq!(inv[1], inv[2]);
    }
}
