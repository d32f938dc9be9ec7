//! Error taxonomy and status codes for the compute kernels.

use thiserror::Error;

/// Status code reported for a successful call.
pub const STATUS_SUCCESS: i32 = 0;

/// Failure kinds raised by the kernels.
///
/// Malformed inputs are rejected before any output buffer is touched.
/// Numerical trouble found mid-computation (`SingularSystem`,
/// `NonConvergence`) may leave best-effort values in the caller's buffers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    #[error("invalid variance components (var_a = {var_a}, var_e = {var_e}); both must be positive with a finite ratio")]
    InvalidVarianceRatio { var_a: f64, var_e: f64 },

    #[error("heritability {0} is outside the permitted range")]
    InvalidHeritability(f64),

    #[error("coefficient matrix is numerically singular at pivot {pivot} (value {value:.3e})")]
    SingularSystem { pivot: usize, value: f64 },

    #[error("no convergence after {iterations} iterations (relative residual {relative_residual:.3e})")]
    NonConvergence {
        iterations: usize,
        relative_residual: f64,
    },

    #[error("non-finite value in {what} at index {index}")]
    NonFiniteInput { what: &'static str, index: usize },

    #[error("invalid pedigree: {0}")]
    InvalidPedigree(String),
}

impl ComputeError {
    /// Stable non-zero status code for this failure kind.
    pub fn status_code(&self) -> i32 {
        match self {
            ComputeError::DimensionMismatch { .. } => 1,
            ComputeError::DegenerateInput(_) => 2,
            ComputeError::InvalidVarianceRatio { .. } => 3,
            ComputeError::InvalidHeritability(_) => 4,
            ComputeError::SingularSystem { .. } => 5,
            ComputeError::NonConvergence { .. } => 6,
            ComputeError::NonFiniteInput { .. } => 7,
            ComputeError::InvalidPedigree(_) => 8,
        }
    }

    /// True for failures that still leave a usable best-effort result behind.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            ComputeError::SingularSystem { .. } | ComputeError::NonConvergence { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;

/// Collapse a kernel result into its status code.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.status_code(),
    }
}

pub(crate) fn check_len(what: &'static str, buf: &[f64], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(ComputeError::DimensionMismatch {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_finite(what: &'static str, buf: &[f64]) -> Result<()> {
    match buf.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(ComputeError::NonFiniteInput { what, index }),
        None => Ok(()),
    }
}
