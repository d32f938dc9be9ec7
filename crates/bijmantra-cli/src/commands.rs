//! Subcommand implementations: load tables, call the kernels, write results.

use anyhow::{anyhow, bail, Context, Result};
use bijmantra_compute::{
    blup, compute_epistatic_matrix, compute_gblup, compute_grm, compute_ibs_matrix, gblup, genomic_inbreeding,
    invert_spd, mean_kinship, reml, GrmSummary, MixedModelData, Pedigree, RelationshipKind, RemlMethod, RrBlup,
};
use clap::ValueEnum;
use std::collections::HashMap;
use std::path::Path;

use crate::config::RunConfig;
use crate::io::{
    load_genotypes_tsv, load_matrix_tsv, load_pedigree_tsv, load_phenotypes_tsv, write_matrix_tsv,
    write_table_tsv, LabelledMatrix,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GrmMethod {
    Vanraden1,
    Vanraden2,
    Dominance,
    Epistatic,
    Ibs,
}

impl From<RelationshipKind> for GrmMethod {
    fn from(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::VanRaden1 => GrmMethod::Vanraden1,
            RelationshipKind::VanRaden2 => GrmMethod::Vanraden2,
            RelationshipKind::Dominance => GrmMethod::Dominance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GenomicModel {
    /// GBLUP through the mixed-model equations
    Gblup,
    /// Ridge-regression BLUP of marker effects
    Rrblup,
    /// Phenotype scaled by heritability
    Shrinkage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemlMethodArg {
    Em,
    Ai,
}

impl From<RemlMethodArg> for RemlMethod {
    fn from(m: RemlMethodArg) -> Self {
        match m {
            RemlMethodArg::Em => RemlMethod::Em,
            RemlMethodArg::Ai => RemlMethod::AverageInformation,
        }
    }
}

pub fn run_grm(
    geno: &Path,
    method: GrmMethod,
    ridge: Option<f64>,
    out: &Path,
    inbreeding_out: Option<&Path>,
    config: &RunConfig,
) -> Result<()> {
    let table = load_genotypes_tsv(geno)?;
    let (n, m) = (table.n_samples(), table.n_markers());
    let buf = table.sample_major();
    log::info!("Loaded {} samples x {} markers from {}", n, m, geno.display());

    let mut g = vec![0.0; n * n];
    let summary = match method {
        GrmMethod::Vanraden1 => compute_grm(&buf, n, m, RelationshipKind::VanRaden1, &mut g)?,
        GrmMethod::Vanraden2 => compute_grm(&buf, n, m, RelationshipKind::VanRaden2, &mut g)?,
        GrmMethod::Dominance => compute_grm(&buf, n, m, RelationshipKind::Dominance, &mut g)?,
        GrmMethod::Epistatic => {
            let mut additive = vec![0.0; n * n];
            let summary = compute_grm(&buf, n, m, RelationshipKind::VanRaden1, &mut additive)?;
            compute_epistatic_matrix(&additive, n, &mut g)?;
            summary
        }
        GrmMethod::Ibs => compute_ibs_matrix(&buf, n, m, &mut g)?,
    };

    let ridge = ridge.unwrap_or(config.grm.ridge);
    if ridge != 0.0 {
        for i in 0..n {
            g[i * n + i] += ridge;
        }
    }
    let summary = GrmSummary::from_matrix(&g, n, summary.markers_used);
    log::info!(
        "{:?}: {} markers used, mean diagonal {:.4}, mean off-diagonal {:.4}",
        method,
        summary.markers_used,
        summary.mean_diagonal,
        summary.mean_off_diagonal
    );

    if let Some(path) = inbreeding_out {
        let f = genomic_inbreeding(&g, n)?;
        let k = mean_kinship(&g, n)?;
        let rows: Vec<(String, Vec<f64>)> = table
            .sample_ids
            .iter()
            .cloned()
            .zip(f.into_iter().zip(k).map(|(f, k)| vec![f, k]))
            .collect();
        write_table_tsv(path, &["sample_id", "inbreeding", "mean_kinship"], &rows)?;
    }

    let matrix = LabelledMatrix::from_row_major(table.sample_ids, g)?;
    write_matrix_tsv(out, &matrix)
}

/// Phenotype records matched to the rows of a relationship matrix.
struct MatchedModel {
    y: Vec<f64>,
    x: Vec<f64>,
    z: Vec<f64>,
    n: usize,
    q: usize,
}

fn match_records(pheno: &Path, trait_name: &str, kinship: &LabelledMatrix) -> Result<MatchedModel> {
    let phenotypes = load_phenotypes_tsv(pheno)?;
    let records = phenotypes.observed(trait_name)?;
    let index = kinship.index();
    let q = kinship.ids.len();

    let mut y = Vec::with_capacity(records.len());
    let mut cols = Vec::with_capacity(records.len());
    let mut dropped = 0;
    for (sample, value) in &records {
        match index.get(sample.as_str()) {
            Some(&j) => {
                y.push(*value);
                cols.push(j);
            }
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        log::warn!("{} records dropped: sample not in relationship matrix", dropped);
    }
    let n = y.len();
    if n == 0 {
        bail!("No phenotype records match the relationship matrix");
    }

    let mut z = vec![0.0; n * q];
    for (r, &j) in cols.iter().enumerate() {
        z[r * q + j] = 1.0;
    }
    Ok(MatchedModel {
        y,
        x: vec![1.0; n],
        z,
        n,
        q,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn run_blup(
    pheno: &Path,
    trait_name: &str,
    kinship_path: &Path,
    is_inverse: bool,
    var_a: f64,
    var_e: f64,
    out: &Path,
    config: &RunConfig,
) -> Result<()> {
    let kinship = load_matrix_tsv(kinship_path)?;
    let model = match_records(pheno, trait_name, &kinship)?;
    let q = model.q;
    let ainv = if is_inverse {
        kinship.row_major()
    } else {
        invert_spd(&kinship.row_major(), q, config.solver.pivot_threshold)
            .with_context(|| format!("inverting {}", kinship_path.display()))?
    };

    let data = MixedModelData::new(&model.y, &model.x, &model.z, model.n, 1, q)?;
    let sol = blup(&data, &ainv, var_a, var_e, &config.solver)?;
    if !sol.converged {
        log::warn!("Solver stopped after {} iterations without converging", sol.iterations);
    }
    log::info!("BLUP: n = {}, q = {}, intercept = {:.6}", model.n, q, sol.beta[0]);

    let mut rows = vec![("(intercept)".to_string(), vec![sol.beta[0]])];
    rows.extend(kinship.ids.iter().cloned().zip(sol.u.iter().map(|u| vec![*u])));
    write_table_tsv(out, &["id", "estimate"], &rows)
}

#[allow(clippy::too_many_arguments)]
pub fn run_reml(
    pheno: &Path,
    trait_name: &str,
    kinship_path: &Path,
    var_a: f64,
    var_e: f64,
    method: Option<RemlMethodArg>,
    out: &Path,
    ebv_out: Option<&Path>,
    config: &RunConfig,
) -> Result<()> {
    let kinship = load_matrix_tsv(kinship_path)?;
    let model = match_records(pheno, trait_name, &kinship)?;
    let data = MixedModelData::new(&model.y, &model.x, &model.z, model.n, 1, model.q)?;

    let mut reml_config = config.reml.clone();
    if let Some(m) = method {
        reml_config.method = m.into();
    }
    let result = reml(&data, &kinship.row_major(), var_a, var_e, &reml_config)?;
    log::info!(
        "REML ({:?}): var_a = {:.6}, var_e = {:.6}, h2 = {:.4}, logL = {:.4}, {} iterations{}",
        reml_config.method,
        result.var_a,
        result.var_e,
        result.heritability,
        result.log_likelihood,
        result.iterations,
        if result.converged { "" } else { " (not converged)" }
    );

    let rows = vec![
        ("var_a".to_string(), vec![result.var_a]),
        ("var_e".to_string(), vec![result.var_e]),
        ("heritability".to_string(), vec![result.heritability]),
        ("log_likelihood".to_string(), vec![result.log_likelihood]),
        ("iterations".to_string(), vec![result.iterations as f64]),
        ("converged".to_string(), vec![if result.converged { 1.0 } else { 0.0 }]),
        ("intercept".to_string(), vec![result.beta[0]]),
    ];
    write_table_tsv(out, &["parameter", "value"], &rows)?;

    if let Some(path) = ebv_out {
        let rows: Vec<(String, Vec<f64>)> = kinship
            .ids
            .iter()
            .cloned()
            .zip(result.u.iter().map(|u| vec![*u]))
            .collect();
        write_table_tsv(path, &["id", "ebv"], &rows)?;
    }
    Ok(())
}

pub fn run_gblup(
    geno: &Path,
    pheno: &Path,
    trait_name: &str,
    heritability: f64,
    model: GenomicModel,
    out: &Path,
    config: &RunConfig,
) -> Result<()> {
    let table = load_genotypes_tsv(geno)?;
    let phenotypes = load_phenotypes_tsv(pheno)?;
    let records = phenotypes.observed(trait_name)?;
    let index: HashMap<&str, usize> = table
        .sample_ids
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    let mut samples = Vec::with_capacity(records.len());
    let mut ids = Vec::with_capacity(records.len());
    let mut y = Vec::with_capacity(records.len());
    for (sample, value) in records {
        let col = *index
            .get(sample.as_str())
            .ok_or_else(|| anyhow!("Sample '{}' has a phenotype but no genotypes", sample))?;
        samples.push(col);
        ids.push(sample);
        y.push(value);
    }
    let n = y.len();
    let m = table.n_markers();
    let train = table.sample_major_subset(&samples);

    let rows: Vec<(String, Vec<f64>)> = match model {
        GenomicModel::Gblup => {
            let res = gblup(&train, &y, n, m, heritability, &config.solver)?;
            log::info!("GBLUP: mean = {:.6}, {} markers used", res.mean, res.grm.markers_used);
            ids.into_iter().zip(res.gebv.into_iter().map(|g| vec![g])).collect()
        }
        GenomicModel::Rrblup => {
            let fit = RrBlup::fit(&train, &y, n, m, heritability, &config.solver)?;
            log::info!(
                "RR-BLUP: lambda = {:.4}, training accuracy = {}",
                fit.lambda,
                fit.accuracy.map_or("NA".to_string(), |a| format!("{:.4}", a))
            );
            // Predict every genotyped sample, phenotyped or not.
            let all = fit.predict(&table.sample_major(), table.n_samples())?;
            table.sample_ids.iter().cloned().zip(all.into_iter().map(|g| vec![g])).collect()
        }
        GenomicModel::Shrinkage => {
            let mut gebv = vec![0.0; n];
            compute_gblup(&train, &y, n, m, heritability, &mut gebv)?;
            ids.into_iter().zip(gebv.into_iter().map(|g| vec![g])).collect()
        }
    };
    write_table_tsv(out, &["id", "gebv"], &rows)
}

pub fn run_pedigree(ped_path: &Path, inverse: bool, out: &Path, inbreeding_out: Option<&Path>) -> Result<()> {
    let table = load_pedigree_tsv(ped_path)?;
    let (sires, dams) = table.parent_indices()?;
    let ped = Pedigree::new(sires, dams)?;
    log::info!("Loaded pedigree with {} individuals", ped.len());

    let matrix = if inverse { ped.inverse() } else { ped.relationship_matrix() };
    write_matrix_tsv(out, &LabelledMatrix::from_row_major(table.ids.clone(), matrix)?)?;

    if let Some(path) = inbreeding_out {
        let rows: Vec<(String, Vec<f64>)> = table
            .ids
            .iter()
            .cloned()
            .zip(ped.inbreeding().into_iter().map(|f| vec![f]))
            .collect();
        write_table_tsv(path, &["id", "inbreeding"], &rows)?;
    }
    Ok(())
}
