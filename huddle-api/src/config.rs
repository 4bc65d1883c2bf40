use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use huddle_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
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
    pub http_port: u16,
    /// Largest WebSocket frame accepted from a client, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            max_message_size: 64 * 1024,
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
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // HUDDLE__SERVER__HTTP_PORT, HUDDLE__SFU__MAX_ROOMS, ...
        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the whole configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors.into_iter().map(|e| format!("sfu: {e}")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.server.host = String::new();
        config.logging.format = "xml".to_string();
        config.sfu.idle_timeout_ms = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.starts_with("server.host")));
        assert!(errors.iter().any(|e| e.starts_with("logging.format")));
        assert!(errors.iter().any(|e| e.starts_with("sfu:")));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/huddle.toml")).unwrap();
        assert_eq!(config.server.http_port, ServerConfig::default().http_port);
    }
}
