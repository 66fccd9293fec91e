//! Configuration management for the letter protection service.
//!
//! Configuration is layered: posture-adjusted defaults, then an optional
//! TOML file, then `LETTERS__*` environment variables.

use std::env;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use thiserror::Error;
use crate::models::{Config, Posture};

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration source error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to encode defaults: {0}")]
    Defaults(#[from] serde_json::Error),
}

/// Read the deployment posture from `APP_ENV`
pub fn posture_from_env() -> Posture {
    env::var("APP_ENV")
        .map(|value| Posture::from_env_value(&value))
        .unwrap_or(Posture::Default)
}

/// Load configuration from defaults, the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(posture_from_env(), Some(&config_file))
}

/// Load configuration for an explicit posture and optional file
pub fn load_config_from(posture: Posture, config_file: Option<&str>) -> Result<Config, ConfigError> {
    let defaults = serde_json::to_string(&Config::for_posture(posture))?;

    let mut builder = ConfigBuilder::builder()
        .add_source(File::from_str(&defaults, FileFormat::Json));

    if let Some(path) = config_file {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    let config: Config = builder
        .add_source(
            Environment::with_prefix("LETTERS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("security.allowed_origins")
                .with_list_parse_key("security.blocked_ips")
                .with_list_parse_key("identity.connecting_ip_headers")
                .with_list_parse_key("detection.honeypot_fields"),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}
