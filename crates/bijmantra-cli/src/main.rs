use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

mod commands;
mod config;
mod io;

use commands::{GenomicModel, GrmMethod, RemlMethodArg};
use config::RunConfig;

/// bijmantra: mixed-model genetic evaluation from the command line
#[derive(Parser)]
#[command(
    name = "bijmantra",
    version,
    about = "bijmantra: relationship matrices, BLUP, REML and genomic prediction"
)]
struct Cli {
    /// JSON file with solver, REML and GRM settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a marker-based relationship matrix
    #[command(after_help = "EXAMPLES:
    bijmantra grm --geno geno.tsv --method vanraden1 --out grm.tsv
    bijmantra grm --geno geno.tsv --method dominance --ridge 0.001 --out dom.tsv")]
    Grm {
        /// Genotype TSV (marker_id, samples...), dosages 0-2, NA for missing
        #[arg(long)]
        geno: PathBuf,
        /// Defaults to the configured kind (vanraden1 without a config file)
        #[arg(long, value_enum)]
        method: Option<GrmMethod>,
        /// Value added to the diagonal
        #[arg(long)]
        ridge: Option<f64>,
        #[arg(long)]
        out: PathBuf,
        /// Optional TSV of genomic inbreeding and mean kinship per sample
        #[arg(long)]
        inbreeding_out: Option<PathBuf>,
    },

    /// Solve the mixed-model equations for known variance components
    Blup {
        /// Phenotype TSV (sample_id, traits...)
        #[arg(long)]
        pheno: PathBuf,
        #[arg(long)]
        r#trait: String,
        /// Relationship matrix TSV
        #[arg(long)]
        kinship: PathBuf,
        /// The kinship file already holds the inverse
        #[arg(long, default_value_t = false)]
        inverse: bool,
        #[arg(long)]
        var_a: f64,
        #[arg(long)]
        var_e: f64,
        #[arg(long)]
        out: PathBuf,
    },

    /// Estimate variance components by REML
    Reml {
        #[arg(long)]
        pheno: PathBuf,
        #[arg(long)]
        r#trait: String,
        #[arg(long)]
        kinship: PathBuf,
        /// Starting additive variance
        #[arg(long, default_value = "1.0")]
        var_a: f64,
        /// Starting residual variance
        #[arg(long, default_value = "1.0")]
        var_e: f64,
        /// Overrides the configured method
        #[arg(long, value_enum)]
        method: Option<RemlMethodArg>,
        /// Parameter summary TSV
        #[arg(long)]
        out: PathBuf,
        /// Optional breeding-value TSV
        #[arg(long)]
        ebv_out: Option<PathBuf>,
    },

    /// Genomic prediction from markers and phenotypes
    Gblup {
        #[arg(long)]
        geno: PathBuf,
        #[arg(long)]
        pheno: PathBuf,
        #[arg(long)]
        r#trait: String,
        /// Heritability used for shrinkage
        #[arg(long)]
        h2: f64,
        #[arg(long, value_enum, default_value = "gblup")]
        model: GenomicModel,
        #[arg(long)]
        out: PathBuf,
    },

    /// Pedigree relationship matrix or its inverse
    Pedigree {
        /// Pedigree TSV (id, sire, dam), parents listed before offspring
        #[arg(long)]
        ped: PathBuf,
        /// Write A-inverse instead of A
        #[arg(long, default_value_t = false)]
        inverse: bool,
        #[arg(long)]
        out: PathBuf,
        /// Optional inbreeding coefficient TSV
        #[arg(long)]
        inbreeding_out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::default()
        .filter_level(LevelFilter::Info)
        .parse_env(env_logger::Env::default().filter_or("BIJMANTRA_LOG", "info"))
        .init();

    let cli = Cli::parse();
    let config = RunConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Grm {
            geno,
            method,
            ridge,
            out,
            inbreeding_out,
        } => {
            let method = method.unwrap_or_else(|| config.grm.kind.into());
            commands::run_grm(&geno, method, ridge, &out, inbreeding_out.as_deref(), &config)?;
        }
        Commands::Blup {
            pheno,
            r#trait,
            kinship,
            inverse,
            var_a,
            var_e,
            out,
        } => {
            commands::run_blup(&pheno, &r#trait, &kinship, inverse, var_a, var_e, &out, &config)?;
        }
        Commands::Reml {
            pheno,
            r#trait,
            kinship,
            var_a,
            var_e,
            method,
            out,
            ebv_out,
        } => {
            commands::run_reml(
                &pheno,
                &r#trait,
                &kinship,
                var_a,
                var_e,
                method,
                &out,
                ebv_out.as_deref(),
                &config,
            )?;
        }
        Commands::Gblup {
            geno,
            pheno,
            r#trait,
            h2,
            model,
            out,
        } => {
            commands::run_gblup(&geno, &pheno, &r#trait, h2, model, &out, &config)?;
        }
        Commands::Pedigree {
            ped,
            inverse,
            out,
            inbreeding_out,
        } => {
            commands::run_pedigree(&ped, inverse, &out, inbreeding_out.as_deref())?;
        }
    }

    Ok(())
}
