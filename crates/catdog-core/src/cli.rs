//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, PipelineConfig, Result};

pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Loads the pipeline config (defaults when `path` is `None`), expands `~`
/// in its paths and validates it.
pub fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config::<PipelineConfig>(path)?
        }
        None => PipelineConfig::default(),
    };
    config.data.data_root = expand_home(&config.data.data_root);
    config.data.archive = expand_home(&config.data.archive);
    config.backbone.weights = config.backbone.weights.as_deref().map(expand_home);
    config.validate()?;
    Ok(config)
}

pub fn save_toml_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Serialization(format!("Failed to serialize config: {e}")))?;
    fs::write(path, content)?;
    Ok(())
}

/// Replaces a leading `~` with `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
