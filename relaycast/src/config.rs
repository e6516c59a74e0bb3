use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};
use relaycast_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix (`RELAYCAST_SERVER_PORT`, ...)
pub const ENV_PREFIX: &str = "RELAYCAST";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted websocket frame, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: relaycast_api::http::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration, later sources overriding earlier ones:
    /// defaults, then the config file (if given and present), then
    /// `RELAYCAST_*` environment variables
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be positive".to_string());
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level: unknown level {}", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
