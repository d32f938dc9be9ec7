//! bijmantra-compute: numerical kernels for breeding-value prediction
//!
//! This crate provides the dense linear-algebra core used for genetic
//! evaluation:
//! - `grm`: genomic relationship matrices (VanRaden 1/2, dominance, epistatic, IBS)
//!   and per-individual genomic inbreeding
//! - `pedigree`: numerator relationship matrix, inbreeding and A⁻¹ from a pedigree
//! - `solver`: conjugate-gradient and Cholesky solvers behind one trait
//! - `mme`: mixed-model equation assembly
//! - `blup`: BLUP of fixed and random effects, plus a simplified GEBV shortcut
//! - `genomic`: GBLUP and RR-BLUP genomic prediction
//! - `reml`: EM-REML and AI-REML variance-component estimation
//!
//! All matrices are row-major `f64` slices with dimensions passed explicitly.
//! Functions borrow their inputs for the duration of one call and keep no
//! state between calls. Diagnostics go through the `log` facade.

pub mod error;

pub mod grm;

pub mod pedigree;

pub mod solver;

pub mod mme;

pub mod blup;

pub mod genomic;

pub mod reml;

pub use error::{status_of, ComputeError, Result, STATUS_SUCCESS};

pub use grm::{
    build_grm, compute_dominance_matrix, compute_epistatic_matrix, compute_grm, compute_grm_vanraden1,
    compute_grm_vanraden2, compute_ibs_matrix, genomic_inbreeding, hadamard, mean_kinship, GrmOptions,
    GrmSummary, RelationshipKind,
};

pub use pedigree::Pedigree;

pub use solver::{
    invert_spd, solve, CholeskyFactor, CholeskySolver, ConjugateGradient, LinearSolver, SolverConfig,
    SolverKind,
};

pub use mme::{MixedModelData, MmeSystem};

pub use blup::{blup, blup_into, compute_gblup, BlupSolution};

pub use genomic::{gblup, GblupResult, RrBlup};

pub use reml::{
    log_likelihood, reml, RemlConfig, RemlIteration, RemlMethod, RemlResult, RemlWarning, VarianceComponent,
};
