//! Optional JSON run configuration.
//!
//! Every section and field may be omitted; missing values take the library
//! defaults. Example:
//!
//! ```json
//! {
//!   "solver": { "kind": "conjugate_gradient", "tolerance": 1e-8 },
//!   "reml": { "method": "average_information", "max_iter": 50 },
//!   "grm": { "kind": "dominance", "ridge": 0.001 }
//! }
//! ```

use anyhow::{Context, Result};
use bijmantra_compute::{GrmOptions, RemlConfig, SolverConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub solver: SolverConfig,
    pub reml: RemlConfig,
    pub grm: GrmOptions,
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: RunConfig =
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        log::debug!("loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
