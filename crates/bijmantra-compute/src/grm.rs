//! Marker-based relationship matrices.
//!
//! Genotypes are row-major `n × m` allele dosages in `[0, 2]` with `NaN` for a
//! missing call. Allele frequencies come from observed calls only, and a
//! missing call is imputed with the marker mean, i.e. it is `0` once centred.
//!
//! The additive (VanRaden 1 and 2) and dominance variants share one assembly
//! routine: each marker is turned into a centred column plus a scale, and the
//! matrix is the scaled cross-product of those columns. Only the upper
//! triangle is summed; the lower triangle is a copy, so every output is
//! exactly symmetric.
//!
//! # Reference
//!
//! VanRaden, P.M. (2008). Efficient methods to compute genomic predictions.
//! J. Dairy Sci. 91:4414-4423.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{check_len, ComputeError, Result};

/// Markers with `2p(1-p)` at or below this are treated as monomorphic.
const MONOMORPHIC_EPS: f64 = 1e-12;

/// Which marker-based relationship matrix to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// `ZZ' / 2Σp(1-p)`
    #[default]
    VanRaden1,
    /// Mean over markers of `z_i z_j / 2p(1-p)`
    VanRaden2,
    /// Heterozygosity-indicator kernel
    Dominance,
}

/// Options for [`build_grm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrmOptions {
    pub kind: RelationshipKind,
    /// Added to every diagonal element after scaling.
    pub ridge: f64,
}

impl Default for GrmOptions {
    fn default() -> Self {
        Self {
            kind: RelationshipKind::VanRaden1,
            ridge: 0.0,
        }
    }
}

/// Descriptive statistics reported alongside a relationship matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrmSummary {
    /// Polymorphic markers that contributed to the matrix.
    pub markers_used: usize,
    pub mean_diagonal: f64,
    pub mean_off_diagonal: f64,
}

impl GrmSummary {
    /// Summarise a finished `n × n` matrix, e.g. after a ridge or Hadamard step.
    pub fn from_matrix(g: &[f64], n: usize, markers_used: usize) -> Self {
        let diag: f64 = (0..n).map(|i| g[i * n + i]).sum();
        let total: f64 = g.iter().sum();
        let mean_diagonal = if n > 0 { diag / n as f64 } else { 0.0 };
        let mean_off_diagonal = if n > 1 {
            (total - diag) / (n * (n - 1)) as f64
        } else {
            0.0
        };
        Self {
            markers_used,
            mean_diagonal,
            mean_off_diagonal,
        }
    }
}

/// Centred marker columns (`n × used`, row-major) and the common divisor.
struct MarkerCoding {
    columns: Vec<f64>,
    used: usize,
    divisor: f64,
}

fn validate_genotypes(genotypes: &[f64], n: usize, m: usize, out: &[f64]) -> Result<()> {
    check_len("genotypes", genotypes, n * m)?;
    check_len("relationship matrix", out, n * n)?;
    // NaN is a missing call; only infinities are rejected.
    if let Some(index) = genotypes.iter().position(|v| v.is_infinite()) {
        return Err(ComputeError::NonFiniteInput {
            what: "genotypes",
            index,
        });
    }
    Ok(())
}

/// Frequency of the counted allele from observed calls, `None` if all missing.
fn allele_frequency(genotypes: &[f64], n: usize, m: usize, k: usize) -> Option<f64> {
    let (sum, count) = (0..n)
        .map(|i| genotypes[i * m + k])
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / (2.0 * count as f64))
}

fn code_markers(genotypes: &[f64], n: usize, m: usize, kind: RelationshipKind) -> Result<MarkerCoding> {
    let mut per_marker: Vec<Vec<f64>> = Vec::new();
    let mut divisor = 0.0;

    for k in 0..m {
        let p = match allele_frequency(genotypes, n, m, k) {
            Some(p) => p,
            None => continue,
        };
        let het_exp = 2.0 * p * (1.0 - p);
        if het_exp <= MONOMORPHIC_EPS {
            continue;
        }

        let column: Vec<f64> = match kind {
            RelationshipKind::VanRaden1 => {
                divisor += het_exp;
                (0..n)
                    .map(|i| {
                        let x = genotypes[i * m + k];
                        if x.is_nan() { 0.0 } else { x - 2.0 * p }
                    })
                    .collect()
            }
            RelationshipKind::VanRaden2 => {
                divisor += 1.0;
                let scale = het_exp.sqrt();
                (0..n)
                    .map(|i| {
                        let x = genotypes[i * m + k];
                        if x.is_nan() { 0.0 } else { (x - 2.0 * p) / scale }
                    })
                    .collect()
            }
            RelationshipKind::Dominance => {
                divisor += het_exp * (1.0 - het_exp);
                let calls: Vec<Option<f64>> = (0..n)
                    .map(|i| {
                        let x = genotypes[i * m + k];
                        if x.is_nan() {
                            None
                        } else if x.round() == 1.0 {
                            Some(1.0)
                        } else {
                            Some(0.0)
                        }
                    })
                    .collect();
                let observed: Vec<f64> = calls.iter().flatten().copied().collect();
                let het_mean = observed.iter().sum::<f64>() / observed.len() as f64;
                calls
                    .into_iter()
                    .map(|h| h.unwrap_or(het_mean) - het_exp)
                    .collect()
            }
        };
        per_marker.push(column);
    }

    let used = per_marker.len();
    if used == 0 || divisor <= 0.0 {
        return Err(ComputeError::DegenerateInput(format!(
            "no polymorphic markers among {} ({:?} divisor is zero)",
            m, kind
        )));
    }
    // Every individual identical at every marker: nothing left to relate.
    if per_marker.iter().flatten().all(|v| v.abs() <= MONOMORPHIC_EPS) {
        return Err(ComputeError::DegenerateInput(format!(
            "all {} centred marker columns are zero; individuals are indistinguishable",
            used
        )));
    }

    let mut columns = vec![0.0; n * used];
    for (k, col) in per_marker.iter().enumerate() {
        for i in 0..n {
            columns[i * used + k] = col[i];
        }
    }

    Ok(MarkerCoding {
        columns,
        used,
        divisor,
    })
}

/// Fill `out` from the upper triangle produced by `entry(i, j)` for `j >= i`.
///
/// Rows are spread over threads; each entry is summed by a single thread.
fn fill_symmetric<F>(out: &mut [f64], n: usize, entry: F)
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| (i..n).map(|j| entry(i, j)).collect())
        .collect();
    for (i, row) in rows.into_iter().enumerate() {
        for (offset, v) in row.into_iter().enumerate() {
            let j = i + offset;
            out[i * n + j] = v;
            out[j * n + i] = v;
        }
    }
}

/// Build a marker-based relationship matrix of the given kind into `out`.
///
/// `out` is written only when the result is `Ok`.
pub fn compute_grm(
    genotypes: &[f64],
    n: usize,
    m: usize,
    kind: RelationshipKind,
    out: &mut [f64],
) -> Result<GrmSummary> {
    validate_genotypes(genotypes, n, m, out)?;
    let coding = code_markers(genotypes, n, m, kind)?;
    let used = coding.used;
    let w = &coding.columns;
    let divisor = coding.divisor;

    fill_symmetric(out, n, |i, j| {
        let ri = &w[i * used..(i + 1) * used];
        let rj = &w[j * used..(j + 1) * used];
        ri.iter().zip(rj).map(|(a, b)| a * b).sum::<f64>() / divisor
    });

    let summary = GrmSummary::from_matrix(out, n, used);
    log::debug!(
        "{:?} relationship matrix: n={}, markers used {}/{}, mean diagonal {:.4}",
        kind,
        n,
        used,
        m,
        summary.mean_diagonal
    );
    Ok(summary)
}

pub fn compute_grm_vanraden1(genotypes: &[f64], n: usize, m: usize, out: &mut [f64]) -> Result<GrmSummary> {
    compute_grm(genotypes, n, m, RelationshipKind::VanRaden1, out)
}

pub fn compute_grm_vanraden2(genotypes: &[f64], n: usize, m: usize, out: &mut [f64]) -> Result<GrmSummary> {
    compute_grm(genotypes, n, m, RelationshipKind::VanRaden2, out)
}

pub fn compute_dominance_matrix(genotypes: &[f64], n: usize, m: usize, out: &mut [f64]) -> Result<GrmSummary> {
    compute_grm(genotypes, n, m, RelationshipKind::Dominance, out)
}

/// Element-wise product of two `n × n` matrices, upper triangle mirrored.
///
/// Gives the A×A, A×D and D×D epistatic kernels.
pub fn hadamard(a: &[f64], b: &[f64], n: usize, out: &mut [f64]) -> Result<()> {
    check_len("left matrix", a, n * n)?;
    check_len("right matrix", b, n * n)?;
    check_len("product matrix", out, n * n)?;
    crate::error::check_finite("left matrix", a)?;
    crate::error::check_finite("right matrix", b)?;
    fill_symmetric(out, n, |i, j| a[i * n + j] * b[i * n + j]);
    Ok(())
}

/// Additive-by-additive epistatic kernel `E = G ∘ G`.
pub fn compute_epistatic_matrix(g: &[f64], n: usize, out: &mut [f64]) -> Result<()> {
    hadamard(g, g, n, out)
}

/// Identity-by-state similarity: mean over jointly observed markers of
/// `1 - |x_i - x_j| / 2`.
///
/// Pairs with no jointly observed marker get 0.
pub fn compute_ibs_matrix(genotypes: &[f64], n: usize, m: usize, out: &mut [f64]) -> Result<GrmSummary> {
    validate_genotypes(genotypes, n, m, out)?;
    if m == 0 {
        return Err(ComputeError::DegenerateInput("no markers".into()));
    }
    fill_symmetric(out, n, |i, j| {
        let (sum, count) = (0..m)
            .map(|k| (genotypes[i * m + k], genotypes[j * m + k]))
            .filter(|(a, b)| !a.is_nan() && !b.is_nan())
            .fold((0.0, 0usize), |(s, c), (a, b)| (s + 1.0 - (a - b).abs() / 2.0, c + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    });
    Ok(GrmSummary::from_matrix(out, n, m))
}

/// Genomic inbreeding `F_i = G_ii - 1`.
///
/// Positive values indicate excess homozygosity relative to the reference
/// allele frequencies, negative values excess heterozygosity.
pub fn genomic_inbreeding(g: &[f64], n: usize) -> Result<Vec<f64>> {
    check_len("relationship matrix", g, n * n)?;
    crate::error::check_finite("relationship matrix", g)?;
    Ok((0..n).map(|i| g[i * n + i] - 1.0).collect())
}

/// Mean relationship of each individual to all others, `0` when `n < 2`.
pub fn mean_kinship(g: &[f64], n: usize) -> Result<Vec<f64>> {
    check_len("relationship matrix", g, n * n)?;
    crate::error::check_finite("relationship matrix", g)?;
    if n < 2 {
        return Ok(vec![0.0; n]);
    }
    Ok((0..n)
        .map(|i| {
            let row = &g[i * n..(i + 1) * n];
            (row.iter().sum::<f64>() - row[i]) / (n - 1) as f64
        })
        .collect())
}

/// Owned convenience wrapper: build the matrix selected by `options`.
pub fn build_grm(genotypes: &[f64], n: usize, m: usize, options: &GrmOptions) -> Result<(Vec<f64>, GrmSummary)> {
    let mut g = vec![0.0; n * n];
    let mut summary = compute_grm(genotypes, n, m, options.kind, &mut g)?;
    if options.ridge != 0.0 {
        for i in 0..n {
            g[i * n + i] += options.ridge;
        }
        summary = GrmSummary::from_matrix(&g, n, summary.markers_used);
    }
    Ok((g, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[rustfmt::skip]
    const GENO: [f64; 6] = [
        0.0, 2.0,
        1.0, 1.0,
        2.0, 0.0,
    ];

    fn assert_exact_symmetry(g: &[f64], n: usize) {
        for i in 0..n {
            for j in 0..n {
                assert_eq!(g[i * n + j].to_bits(), g[j * n + i].to_bits());
            }
        }
    }

    #[test]
    fn test_vanraden1_hand_computed() {
        let mut g = [0.0; 9];
        let summary = compute_grm_vanraden1(&GENO, 3, 2, &mut g).unwrap();
        #[rustfmt::skip]
        let expected = [
             2.0, 0.0, -2.0,
             0.0, 0.0,  0.0,
            -2.0, 0.0,  2.0,
        ];
        for (a, b) in g.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_eq!(summary.markers_used, 2);
        assert_relative_eq!(summary.mean_diagonal, 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(summary.mean_off_diagonal, -4.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vanraden2_equal_frequencies_match_vanraden1() {
        let mut g1 = [0.0; 9];
        let mut g2 = [0.0; 9];
        compute_grm_vanraden1(&GENO, 3, 2, &mut g1).unwrap();
        compute_grm_vanraden2(&GENO, 3, 2, &mut g2).unwrap();
        for (a, b) in g1.iter().zip(g2.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_dominance_hand_computed() {
        let mut d = [0.0; 9];
        compute_dominance_matrix(&GENO, 3, 2, &mut d).unwrap();
        #[rustfmt::skip]
        let expected = [
             1.0, -1.0,  1.0,
            -1.0,  1.0, -1.0,
             1.0, -1.0,  1.0,
        ];
        for (a, b) in d.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_missing_call_is_centred_to_zero() {
        let geno = [0.0, 2.0, f64::NAN];
        let mut g = [0.0; 9];
        compute_grm_vanraden1(&geno, 3, 1, &mut g).unwrap();
        assert_relative_eq!(g[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], -2.0, epsilon = 1e-12);
        assert_eq!(g[8], 0.0);
        assert_eq!(g[2], 0.0);
    }

    #[test]
    fn test_identical_individuals_are_degenerate() {
        let geno = [1.0, 0.0, 2.0, 1.0, 0.0, 2.0];
        let mut g = [-1.0; 4];
        let err = compute_grm_vanraden1(&geno, 2, 3, &mut g).unwrap_err();
        assert!(matches!(err, ComputeError::DegenerateInput(_)));
        assert_eq!(g, [-1.0; 4]);

        let err = compute_grm_vanraden2(&geno, 2, 3, &mut g).unwrap_err();
        assert!(matches!(err, ComputeError::DegenerateInput(_)));
    }

    #[test]
    fn test_fixed_heterozygous_marker_stays_in_divisor() {
        // marker 1 = [0, 2], marker 2 = [1, 1]
        #[rustfmt::skip]
        let geno = [
            0.0, 1.0,
            2.0, 1.0,
        ];
        let mut g = [0.0; 4];
        let summary = compute_grm_vanraden1(&geno, 2, 2, &mut g).unwrap();
        assert_eq!(summary.markers_used, 2);
        for (a, b) in g.iter().zip([1.0, -1.0, -1.0, 1.0].iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }

        let summary = compute_grm_vanraden2(&geno, 2, 2, &mut g).unwrap();
        assert_eq!(summary.markers_used, 2);
        assert_relative_eq!(g[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_all_missing_marker_is_skipped() {
        #[rustfmt::skip]
        let geno = [
            0.0, f64::NAN,
            1.0, f64::NAN,
            2.0, f64::NAN,
        ];
        let mut g = [0.0; 9];
        let summary = compute_grm_vanraden2(&geno, 3, 2, &mut g).unwrap();
        assert_eq!(summary.markers_used, 1);
        assert!(g.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_infinite_dosage_rejected() {
        let geno = [0.0, f64::INFINITY, 1.0, 2.0];
        let mut g = [0.0; 4];
        let err = compute_grm_vanraden1(&geno, 2, 2, &mut g).unwrap_err();
        assert_eq!(err, ComputeError::NonFiniteInput { what: "genotypes", index: 1 });
    }

    #[test]
    fn test_wrong_output_size_rejected() {
        let mut g = [0.0; 8];
        let err = compute_grm_vanraden1(&GENO, 3, 2, &mut g).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { expected: 9, actual: 8, .. }));
    }

    #[test]
    fn test_epistatic_is_elementwise_square() {
        let mut g = [0.0; 9];
        compute_grm_vanraden1(&GENO, 3, 2, &mut g).unwrap();
        let mut e = [0.0; 9];
        compute_epistatic_matrix(&g, 3, &mut e).unwrap();
        for k in 0..9 {
            assert_relative_eq!(e[k], g[k] * g[k], epsilon = 1e-12);
        }
        assert_exact_symmetry(&e, 3);
    }

    #[test]
    fn test_ibs_diagonal_is_one() {
        let mut s = [0.0; 9];
        compute_ibs_matrix(&GENO, 3, 2, &mut s).unwrap();
        for i in 0..3 {
            assert_relative_eq!(s[i * 3 + i], 1.0);
        }
        // 0 vs 2 at both markers
        assert_relative_eq!(s[2], 0.0);
        assert_relative_eq!(s[1], 0.5);
    }

    #[test]
    fn test_ridge_added_to_diagonal() {
        let opts = GrmOptions {
            ridge: 0.001,
            ..Default::default()
        };
        let (g, summary) = build_grm(&GENO, 3, 2, &opts).unwrap();
        assert_relative_eq!(g[0], 2.001, epsilon = 1e-12);
        assert_relative_eq!(g[4], 0.001, epsilon = 1e-12);
        assert_eq!(summary.markers_used, 2);
    }

    #[test]
    fn test_inbreeding_and_mean_kinship() {
        let mut g = [0.0; 9];
        compute_grm_vanraden1(&GENO, 3, 2, &mut g).unwrap();
        let f = genomic_inbreeding(&g, 3).unwrap();
        assert_relative_eq!(f[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(f[1], -1.0, epsilon = 1e-12);
        let k = mean_kinship(&g, 3).unwrap();
        assert_relative_eq!(k[0], -1.0, epsilon = 1e-12);
        assert_relative_eq!(k[1], 0.0, epsilon = 1e-12);
        assert_eq!(mean_kinship(&[1.2], 1).unwrap(), vec![0.0]);
        assert!(matches!(
            genomic_inbreeding(&g[..8], 3),
            Err(ComputeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_summary_from_epistatic_matrix() {
        let mut g = [0.0; 9];
        compute_grm_vanraden1(&GENO, 3, 2, &mut g).unwrap();
        let mut e = [0.0; 9];
        compute_epistatic_matrix(&g, 3, &mut e).unwrap();
        let summary = GrmSummary::from_matrix(&e, 3, 2);
        assert_relative_eq!(summary.mean_diagonal, 8.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(summary.mean_off_diagonal, 8.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_all_variants_exactly_symmetric() {
        #[rustfmt::skip]
        let geno = [
            0.0, 1.0, 2.0, 1.0, 0.3,
            1.0, 1.0, 0.0, 2.0, 1.7,
            2.0, f64::NAN, 1.0, 0.0, 0.9,
            1.0, 0.0, 1.0, 1.0, 2.0,
        ];
        for kind in [
            RelationshipKind::VanRaden1,
            RelationshipKind::VanRaden2,
            RelationshipKind::Dominance,
        ] {
            let mut g = [0.0; 16];
            compute_grm(&geno, 4, 5, kind, &mut g).unwrap();
            assert_exact_symmetry(&g, 4);
        }
    }
}
