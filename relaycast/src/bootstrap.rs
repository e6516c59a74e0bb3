use anyhow::Result;
use std::path::Path;

use crate::config::Config;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RELAYCAST_CONFIG_PATH";

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Locate, load and validate the configuration
///
/// Search order: the explicit path, `RELAYCAST_CONFIG_PATH`, `./config.yaml`,
/// then environment variables and defaults alone. A named file that does not
/// exist is an error. Runs before logging is up, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let named = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok());
    if let Some(path) = named.as_deref().filter(|p| !Path::new(p).exists()) {
        anyhow::bail!("Config file {path} does not exist");
    }

    let config_path = named.or_else(|| {
        Path::new(DEFAULT_CONFIG_FILE)
            .exists()
            .then(|| DEFAULT_CONFIG_FILE.to_string())
    });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
