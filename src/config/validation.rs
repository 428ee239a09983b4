//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Exactly one addressing scheme, consistent with the bind mode
//! - TLS certificate paths present when TLS is enabled in tcp mode
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>

use std::fmt;

use crate::config::schema::{BindMode, GatewayConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let bind = &config.bind;

    match bind.mode {
        BindMode::Unix => {
            if bind.socket.is_none() {
                errors.push(ValidationError::new("bind.socket", "required in unix mode"));
            }
            if bind.host.is_some() || bind.port.is_some() {
                errors.push(ValidationError::new(
                    "bind.host",
                    "host/port must not be set in unix mode",
                ));
            }
        }
        BindMode::Tcp => {
            match bind.host.as_deref() {
                None | Some("") => {
                    errors.push(ValidationError::new("bind.host", "required in tcp mode"))
                }
                Some(_) => {}
            }
            if bind.port.is_none() {
                errors.push(ValidationError::new("bind.port", "required in tcp mode"));
            }
            if bind.socket.is_some() {
                errors.push(ValidationError::new(
                    "bind.socket",
                    "must not be set in tcp mode",
                ));
            }
        }
    }

    if config.ssl.enable && bind.mode == BindMode::Tcp && config.ssl.certificate.is_none() {
        errors.push(ValidationError::new(
            "ssl.certificate",
            "required when TLS is enabled",
        ));
    }

    if config.worker.start_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "worker.start_timeout_secs",
            "must be greater than zero",
        ));
    }

    if config.gateway.vacuum_interval_secs == 0 {
        errors.push(ValidationError::new(
            "gateway.vacuum_interval_secs",
            "must be greater than zero",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BindConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn mixed_schemes_are_rejected() {
        let mut config = GatewayConfig::default();
        config.bind = BindConfig::unix("/tmp/x.sock");
        config.bind.port = Some(80);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "bind.host");
    }

    #[test]
    fn tls_without_certificate_is_rejected() {
        let mut config = GatewayConfig::default();
        config.ssl.enable = true;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "ssl.certificate");
    }

    #[test]
    fn tls_is_ignored_in_unix_mode() {
        let mut config = GatewayConfig::default();
        config.bind = BindConfig::unix("/tmp/x.sock");
        config.ssl.enable = true;

        assert!(validate_config(&config).is_ok());
    }
}
