//! Pedigree-based numerator relationship matrix.
//!
//! Individuals are indexed `0..n` and each parent must appear before its
//! offspring. Selfing (sire == dam) is allowed.

use crate::error::{ComputeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Pedigree {
    sires: Vec<Option<usize>>,
    dams: Vec<Option<usize>>,
}

impl Pedigree {
    pub fn new(sires: Vec<Option<usize>>, dams: Vec<Option<usize>>) -> Result<Self> {
        if sires.len() != dams.len() {
            return Err(ComputeError::DimensionMismatch {
                what: "dams",
                expected: sires.len(),
                actual: dams.len(),
            });
        }
        for (i, (s, d)) in sires.iter().zip(&dams).enumerate() {
            for parent in [s, d].into_iter().flatten() {
                if *parent >= i {
                    return Err(ComputeError::InvalidPedigree(format!(
                        "individual {} has parent {} that does not precede it",
                        i, parent
                    )));
                }
            }
        }
        Ok(Self { sires, dams })
    }

    pub fn len(&self) -> usize {
        self.sires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sires.is_empty()
    }

    pub fn parents(&self, i: usize) -> (Option<usize>, Option<usize>) {
        (self.sires[i], self.dams[i])
    }

    /// Numerator relationship matrix A by the tabular method, row-major `n × n`.
    pub fn relationship_matrix(&self) -> Vec<f64> {
        let n = self.len();
        let mut a = vec![0.0; n * n];
        for i in 0..n {
            let (s, d) = self.parents(i);
            for j in 0..i {
                let from_s = s.map_or(0.0, |s| a[j * n + s]);
                let from_d = d.map_or(0.0, |d| a[j * n + d]);
                let v = 0.5 * (from_s + from_d);
                a[i * n + j] = v;
                a[j * n + i] = v;
            }
            a[i * n + i] = match (s, d) {
                (Some(s), Some(d)) => 1.0 + 0.5 * a[s * n + d],
                _ => 1.0,
            };
        }
        a
    }

    /// Inbreeding coefficients `F_i = A_ii - 1`.
    pub fn inbreeding(&self) -> Vec<f64> {
        let n = self.len();
        let a = self.relationship_matrix();
        (0..n).map(|i| a[i * n + i] - 1.0).collect()
    }

    /// A⁻¹ built directly by Henderson's rules, accounting for parental
    /// inbreeding.
    pub fn inverse(&self) -> Vec<f64> {
        let n = self.len();
        let f = self.inbreeding();
        let mut ainv = vec![0.0; n * n];

        for i in 0..n {
            let (s, d) = self.parents(i);
            let b = match (s, d) {
                (Some(s), Some(d)) => 0.5 - 0.25 * (f[s] + f[d]),
                (Some(p), None) | (None, Some(p)) => 0.75 - 0.25 * f[p],
                (None, None) => 1.0,
            };
            let alpha = 1.0 / b;

            // q = e_i - ½ e_s - ½ e_d, add alpha·qq'
            let mut q: Vec<(usize, f64)> = vec![(i, 1.0)];
            q.extend(s.map(|s| (s, -0.5)));
            q.extend(d.map(|d| (d, -0.5)));
            for &(r, qr) in &q {
                for &(c, qc) in &q {
                    ainv[r * n + c] += alpha * qr * qc;
                }
            }
        }
        ainv
    }
}
