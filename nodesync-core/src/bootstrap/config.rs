//! Configuration loading

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::Config;

/// Resolve, load and validate the server configuration
///
/// The first existing file wins: `$NODESYNC_CONFIG_PATH`, `./config.yaml`,
/// then `/config/config.yaml`. With none of them present, or when the file
/// fails to parse, only `NODESYNC_*` environment variables are used.
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var("NODESYNC_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| existing("config.yaml"))
        .or_else(|| existing("/config/config.yaml"));

    // Logging is not up yet, so report to stderr
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).or_else(|e| {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Falling back to environment variables");
            Config::from_env()
        })?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!(
        mode = ?config.services.mode,
        driver = %config.services.driver,
        discovery = config.services.enable.discovery,
        consumers = config.services.consumers.len(),
        "Configuration loaded"
    );

    Ok(config)
}

fn existing(path: &str) -> Option<String> {
    Path::new(path).exists().then(|| path.to_string())
}
