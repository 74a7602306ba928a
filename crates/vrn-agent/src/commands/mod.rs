//! Command handlers.

pub mod check_config;
pub mod run;

use std::path::{Path, PathBuf};

use vrn_config::Config;
use vrn_core::TopologySeed;

use crate::cli::GlobalOpts;
use crate::error::AgentError;

/// The config file in effect: `-c`, else the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(vrn_config::config_path)
}

pub fn load_config(global: &GlobalOpts) -> Result<Config, AgentError> {
    let path = config_file(global);
    vrn_config::load_config(Some(&path)).map_err(|source| AgentError::Config {
        path: path.display().to_string(),
        source,
    })
}

/// Read and validate a topology seed file.
pub fn load_seed(path: &Path) -> Result<TopologySeed, AgentError> {
    let text = std::fs::read_to_string(path).map_err(|source| AgentError::TopologyFile {
        path: path.to_path_buf(),
        source,
    })?;
    let seed_error = |source| AgentError::Seed {
        path: path.to_path_buf(),
        source,
    };
    let seed = TopologySeed::from_json(&text).map_err(seed_error)?;
    seed.validate().map_err(seed_error)?;
    Ok(seed)
}
