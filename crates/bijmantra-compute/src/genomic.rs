//! Genomic prediction from marker genotypes.
//!
//! - [`gblup`]: breeding values through the MME with a VanRaden genomic
//!   relationship matrix.
//! - [`RrBlup`]: ridge regression on centred markers, with prediction for new
//!   individuals.
//!
//! Genotype conventions follow [`crate::grm`]: row-major `n × m` dosages,
//! `NaN` for missing, imputed with the marker mean.

use serde::{Deserialize, Serialize};

use crate::blup::blup;
use crate::error::{check_finite, check_len, ComputeError, Result};
use crate::grm::{build_grm, GrmOptions, GrmSummary, RelationshipKind};
use crate::mme::{identity, MixedModelData};
use crate::solver::{invert_spd, SolverConfig};

/// Diagonal ridge added to G before inversion.
pub const GBLUP_RIDGE: f64 = 0.001;

fn check_heritability_open(h2: f64) -> Result<()> {
    if h2 > 0.0 && h2 < 1.0 {
        Ok(())
    } else {
        Err(ComputeError::InvalidHeritability(h2))
    }
}

fn reject_infinite(genotypes: &[f64]) -> Result<()> {
    match genotypes.iter().position(|v| v.is_infinite()) {
        Some(index) => Err(ComputeError::NonFiniteInput {
            what: "genotypes",
            index,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GblupResult {
    /// Intercept
    pub mean: f64,
    /// Genomic estimated breeding values, one per individual
    pub gebv: Vec<f64>,
    pub grm: GrmSummary,
    pub iterations: usize,
    pub converged: bool,
    /// Per-individual reliability, available when G was solved directly
    pub reliability: Option<Vec<f64>>,
    pub pev: Option<Vec<f64>>,
}

/// GBLUP with an intercept, `Z = I` and `σe²/σa² = (1 − h²)/h²`.
pub fn gblup(
    genotypes: &[f64],
    phenotypes: &[f64],
    n: usize,
    m: usize,
    heritability: f64,
    solver: &SolverConfig,
) -> Result<GblupResult> {
    check_len("genotypes", genotypes, n * m)?;
    check_len("phenotypes", phenotypes, n)?;
    check_heritability_open(heritability)?;
    check_finite("phenotypes", phenotypes)?;

    let options = GrmOptions {
        kind: RelationshipKind::VanRaden1,
        ridge: GBLUP_RIDGE,
    };
    let (g, summary) = build_grm(genotypes, n, m, &options)?;
    let ginv = invert_spd(&g, n, solver.pivot_threshold)?;

    let x = vec![1.0; n];
    let z = identity(n);
    let data = MixedModelData::new(phenotypes, &x, &z, n, 1, n)?;
    let sol = blup(&data, &ginv, heritability, 1.0 - heritability, solver)?;

    Ok(GblupResult {
        mean: sol.beta[0],
        gebv: sol.u,
        grm: summary,
        iterations: sol.iterations,
        converged: sol.converged,
        reliability: sol.reliability,
        pev: sol.pev,
    })
}

/// Fitted ridge-regression BLUP model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrBlup {
    /// Phenotypic mean of the training set
    pub mean: f64,
    pub marker_effects: Vec<f64>,
    /// Training allele frequencies used for centring
    pub allele_freqs: Vec<f64>,
    /// `m (1 − h²) / h²`
    pub lambda: f64,
    /// Training-set GEBVs
    pub gebv: Vec<f64>,
    /// Pearson correlation between phenotypes and training GEBVs
    pub accuracy: Option<f64>,
    pub converged: bool,
}

fn centred_markers(genotypes: &[f64], n: usize, freqs: &[f64]) -> Vec<f64> {
    let m = freqs.len();
    let mut z = vec![0.0; n * m];
    for i in 0..n {
        for k in 0..m {
            let x = genotypes[i * m + k];
            z[i * m + k] = if x.is_nan() { 0.0 } else { x - 2.0 * freqs[k] };
        }
    }
    z
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma) * (x - ma);
        sbb += (y - mb) * (y - mb);
    }
    let denom = (saa * sbb).sqrt();
    (denom > 0.0).then(|| sab / denom)
}

impl RrBlup {
    /// Fit marker effects from `(Z'Z + λI) a = Z'(y − ȳ)`.
    ///
    /// When markers outnumber individuals the equivalent `n`-dimensional
    /// system `(ZZ' + λI) b = y − ȳ`, `a = Z'b` is solved instead.
    pub fn fit(
        genotypes: &[f64],
        phenotypes: &[f64],
        n: usize,
        m: usize,
        heritability: f64,
        solver: &SolverConfig,
    ) -> Result<Self> {
        check_len("genotypes", genotypes, n * m)?;
        check_len("phenotypes", phenotypes, n)?;
        check_heritability_open(heritability)?;
        check_finite("phenotypes", phenotypes)?;
        reject_infinite(genotypes)?;
        if n == 0 || m == 0 {
            return Err(ComputeError::DegenerateInput("empty training set".into()));
        }

        let allele_freqs: Vec<f64> = (0..m)
            .map(|k| {
                let (sum, count) = (0..n)
                    .map(|i| genotypes[i * m + k])
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                if count == 0 { 0.0 } else { sum / (2.0 * count as f64) }
            })
            .collect();
        let z = centred_markers(genotypes, n, &allele_freqs);

        let lambda = m as f64 * (1.0 - heritability) / heritability;
        let mean = phenotypes.iter().sum::<f64>() / n as f64;
        let yc: Vec<f64> = phenotypes.iter().map(|y| y - mean).collect();

        let (marker_effects, converged) = if m <= n {
            let mut lhs = vec![0.0; m * m];
            let mut rhs = vec![0.0; m];
            for i in 0..n {
                let row = &z[i * m..(i + 1) * m];
                for a in 0..m {
                    rhs[a] += row[a] * yc[i];
                    for b in a..m {
                        lhs[a * m + b] += row[a] * row[b];
                    }
                }
            }
            for a in 0..m {
                lhs[a * m + a] += lambda;
                for b in (a + 1)..m {
                    lhs[b * m + a] = lhs[a * m + b];
                }
            }
            let mut effects = vec![0.0; m];
            let converged = solve_folded(solver, &lhs, &rhs, &mut effects, m)?;
            (effects, converged)
        } else {
            let mut lhs = vec![0.0; n * n];
            for i in 0..n {
                for j in i..n {
                    let v: f64 = z[i * m..(i + 1) * m]
                        .iter()
                        .zip(&z[j * m..(j + 1) * m])
                        .map(|(a, b)| a * b)
                        .sum();
                    lhs[i * n + j] = v;
                    lhs[j * n + i] = v;
                }
                lhs[i * n + i] += lambda;
            }
            let mut b = vec![0.0; n];
            let converged = solve_folded(solver, &lhs, &yc, &mut b, n)?;
            let effects = (0..m)
                .map(|k| (0..n).map(|i| z[i * m + k] * b[i]).sum())
                .collect();
            (effects, converged)
        };

        let gebv: Vec<f64> = (0..n)
            .map(|i| {
                mean + z[i * m..(i + 1) * m]
                    .iter()
                    .zip(&marker_effects)
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
            })
            .collect();
        let accuracy = pearson(phenotypes, &gebv);
        log::debug!(
            "RR-BLUP fit: n={}, m={}, lambda={:.4}, accuracy={:?}",
            n,
            m,
            lambda,
            accuracy
        );

        Ok(Self {
            mean,
            marker_effects,
            allele_freqs,
            lambda,
            gebv,
            accuracy,
            converged,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.marker_effects.len()
    }

    /// GEBVs for new individuals, centred by the training allele frequencies.
    pub fn predict(&self, genotypes: &[f64], n: usize) -> Result<Vec<f64>> {
        let m = self.n_markers();
        check_len("genotypes", genotypes, n * m)?;
        reject_infinite(genotypes)?;
        let z = centred_markers(genotypes, n, &self.allele_freqs);
        Ok((0..n)
            .map(|i| {
                self.mean
                    + z[i * m..(i + 1) * m]
                        .iter()
                        .zip(&self.marker_effects)
                        .map(|(a, b)| a * b)
                        .sum::<f64>()
            })
            .collect())
    }
}

/// Solve and report convergence, keeping best-effort values on
/// non-convergence.
fn solve_folded(solver: &SolverConfig, c: &[f64], rhs: &[f64], x: &mut [f64], dim: usize) -> Result<bool> {
    match crate::solver::solve(solver, c, rhs, x, dim) {
        Ok(_) => Ok(true),
        Err(ComputeError::NonConvergence { iterations, .. }) => {
            log::warn!("RR-BLUP solve stopped after {} iterations", iterations);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
