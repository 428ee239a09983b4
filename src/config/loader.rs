//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use rand::RngCore;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: GatewayConfig = toml::from_str(&content)?;
    config.bind.normalize();

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Write the configuration back to disk.
pub fn save_config(path: &Path, config: &GatewayConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Generate the token secret if the config has none, persisting it.
///
/// Returns `true` when a new secret was written.
pub fn ensure_secret(path: &Path, config: &mut GatewayConfig) -> Result<bool, ConfigError> {
    if !config.auth.secret.is_empty() {
        return Ok(false);
    }

    tracing::info!(path = %path.display(), "No secret found, generating a new one");
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    config.auth.secret = bytes.iter().map(|b| format!("{b:02x}")).collect();
    save_config(path, config)?;
    Ok(true)
}
