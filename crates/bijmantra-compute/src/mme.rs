//! Henderson's mixed-model equations.
//!
//! For `y = Xβ + Zu + e` with `Var(u) = A·σa²` and `Var(e) = I·σe²`:
//!
//! ```text
//! [X'X        X'Z          ] [β]   [X'y]
//! [Z'X   Z'Z + α·A⁻¹       ] [u] = [Z'y]      α = σe² / σa²
//! ```

use crate::error::{check_finite, check_len, Result};

/// Borrowed model inputs with their dimensions. All matrices are row-major.
///
/// Only [`MixedModelData::new`] builds one outside this crate, so the slice
/// lengths always agree with `n`, `p` and `q`.
#[derive(Debug, Clone, Copy)]
pub struct MixedModelData<'a> {
    pub(crate) y: &'a [f64],
    /// `n × p` fixed-effect design.
    pub(crate) x: &'a [f64],
    /// `n × q` random-effect design.
    pub(crate) z: &'a [f64],
    pub(crate) n: usize,
    pub(crate) p: usize,
    pub(crate) q: usize,
}

/// An assembled coefficient matrix and right-hand side of order `p + q`.
#[derive(Debug, Clone, PartialEq)]
pub struct MmeSystem {
    pub c: Vec<f64>,
    pub rhs: Vec<f64>,
    pub p: usize,
    pub q: usize,
}

impl MmeSystem {
    pub fn dim(&self) -> usize {
        self.p + self.q
    }
}

impl<'a> MixedModelData<'a> {
    /// Wrap and validate model inputs.
    pub fn new(y: &'a [f64], x: &'a [f64], z: &'a [f64], n: usize, p: usize, q: usize) -> Result<Self> {
        let data = Self { y, x, z, n, p, q };
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<()> {
        check_len("phenotypes", self.y, self.n)?;
        check_len("fixed-effect design", self.x, self.n * self.p)?;
        check_len("random-effect design", self.z, self.n * self.q)?;
        check_finite("phenotypes", self.y)?;
        check_finite("fixed-effect design", self.x)?;
        check_finite("random-effect design", self.z)?;
        Ok(())
    }

    pub fn y(&self) -> &'a [f64] {
        self.y
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn q(&self) -> usize {
        self.q
    }

    pub fn dim(&self) -> usize {
        self.p + self.q
    }

    /// Row `r` of `W = [X Z]` as (column, value) pairs, zeros skipped.
    fn design_row(&self, r: usize) -> Vec<(usize, f64)> {
        let (p, q) = (self.p, self.q);
        let xs = self.x[r * p..(r + 1) * p].iter().enumerate();
        let zs = self.z[r * q..(r + 1) * q]
            .iter()
            .enumerate()
            .map(|(j, v)| (p + j, v));
        xs.chain(zs)
            .filter(|(_, v)| **v != 0.0)
            .map(|(j, v)| (j, *v))
            .collect()
    }

    /// `W'W` (upper triangle mirrored) and `W'v`.
    pub fn cross_products(&self, v: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        check_len("cross-product vector", v, self.n)?;
        let dim = self.dim();
        let mut c = vec![0.0; dim * dim];
        let mut rhs = vec![0.0; dim];
        for r in 0..self.n {
            let row = self.design_row(r);
            for (a, &(i, wi)) in row.iter().enumerate() {
                rhs[i] += wi * v[r];
                for &(j, wj) in &row[a..] {
                    c[i * dim + j] += wi * wj;
                }
            }
        }
        for i in 0..dim {
            for j in (i + 1)..dim {
                c[j * dim + i] = c[i * dim + j];
            }
        }
        Ok((c, rhs))
    }

    /// `W'v` for a length-`n` vector.
    pub(crate) fn transpose_times(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.dim()];
        for r in 0..self.n {
            for (j, w) in self.design_row(r) {
                out[j] += w * v[r];
            }
        }
        out
    }

    /// Build the MME with `ratio = σe²/σa²` and a `q × q` inverse relationship
    /// matrix, symmetrised as `½(A⁻¹ + A⁻ᵀ)`.
    pub fn assemble(&self, ainv: &[f64], ratio: f64) -> Result<MmeSystem> {
        let (p, q) = (self.p, self.q);
        self.validate()?;
        check_len("inverse relationship matrix", ainv, q * q)?;
        check_finite("inverse relationship matrix", ainv)?;
        let dim = self.dim();
        let (mut c, rhs) = self.cross_products(self.y)?;
        for i in 0..q {
            for j in 0..q {
                let sym = 0.5 * (ainv[i * q + j] + ainv[j * q + i]);
                c[(p + i) * dim + p + j] += ratio * sym;
            }
        }
        Ok(MmeSystem { c, rhs, p, q })
    }

    /// `Xβ + Zu`.
    pub fn fitted(&self, beta: &[f64], u: &[f64]) -> Result<Vec<f64>> {
        check_len("beta", beta, self.p)?;
        check_len("u", u, self.q)?;
        Ok(self.fitted_unchecked(beta, u))
    }

    /// `y − Xβ − Zu`.
    pub fn residuals(&self, beta: &[f64], u: &[f64]) -> Result<Vec<f64>> {
        check_len("beta", beta, self.p)?;
        check_len("u", u, self.q)?;
        Ok(self.residuals_unchecked(beta, u))
    }

    pub(crate) fn fitted_unchecked(&self, beta: &[f64], u: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|r| {
                let xb: f64 = self.x[r * self.p..(r + 1) * self.p]
                    .iter()
                    .zip(beta)
                    .map(|(a, b)| a * b)
                    .sum();
                let zu: f64 = self.z[r * self.q..(r + 1) * self.q]
                    .iter()
                    .zip(u)
                    .map(|(a, b)| a * b)
                    .sum();
                xb + zu
            })
            .collect()
    }

    pub(crate) fn residuals_unchecked(&self, beta: &[f64], u: &[f64]) -> Vec<f64> {
        self.fitted_unchecked(beta, u)
            .into_iter()
            .zip(self.y)
            .map(|(f, y)| y - f)
            .collect()
    }
}

/// Row-major identity of order `n`.
pub fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}
