//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default idle window for sessions, in seconds.
pub const DEFAULT_SESSION_MAX_TIME: u64 = 3600;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server name shown in identity and manifest responses.
    pub name: String,

    /// Optional theme color.
    pub color: Option<String>,

    /// Idle window in seconds. `0` means the default (3600).
    pub session_max_time: u64,

    /// Listening socket configuration.
    pub bind: BindConfig,

    /// TLS configuration (honored in tcp mode only).
    pub ssl: TlsConfig,

    /// Authentication settings.
    pub auth: AuthConfig,

    /// Worker process settings.
    pub worker: WorkerConfig,

    /// Gateway loop settings.
    pub gateway: GateConfig,

    /// Framed transport settings.
    pub transport: TransportConfig,

    /// Plugin discovery.
    pub plugins: PluginsConfig,

    /// Outgoing notifications.
    pub email: EmailConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "panel".to_string(),
            color: None,
            session_max_time: DEFAULT_SESSION_MAX_TIME,
            bind: BindConfig::default(),
            ssl: TlsConfig::default(),
            auth: AuthConfig::default(),
            worker: WorkerConfig::default(),
            gateway: GateConfig::default(),
            transport: TransportConfig::default(),
            plugins: PluginsConfig::default(),
            email: EmailConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Effective idle window, falling back to the default when unset.
    pub fn session_max_time(&self) -> u64 {
        if self.session_max_time == 0 {
            DEFAULT_SESSION_MAX_TIME
        } else {
            self.session_max_time
        }
    }
}

/// Socket addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Unix,
    Tcp,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BindConfig {
    /// `unix` or `tcp`.
    pub mode: BindMode,

    /// UNIX socket path (unix mode).
    pub socket: Option<PathBuf>,

    /// Host or IP literal (tcp mode).
    pub host: Option<String>,

    /// TCP port (tcp mode).
    pub port: Option<u16>,

    /// Try to set TCP_CORK on the listening socket.
    pub tcp_cork: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            mode: BindMode::Tcp,
            socket: None,
            host: Some("0.0.0.0".to_string()),
            port: Some(8000),
            tcp_cork: true,
        }
    }
}

/// Resolved addressing scheme of a [`BindConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl BindConfig {
    /// A unix-mode bind config.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: BindMode::Unix,
            socket: Some(path.into()),
            host: None,
            port: None,
            tcp_cork: false,
        }
    }

    /// A tcp-mode bind config.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: BindMode::Tcp,
            socket: None,
            host: Some(host.into()),
            port: Some(port),
            tcp_cork: true,
        }
    }

    /// Clear the fields of the addressing scheme `mode` does not select.
    pub fn normalize(&mut self) {
        match self.mode {
            BindMode::Unix => {
                self.host = None;
                self.port = None;
            }
            BindMode::Tcp => self.socket = None,
        }
    }

    /// The addressing scheme selected by `mode`, if it is fully populated.
    pub fn target(&self) -> Option<BindTarget> {
        match self.mode {
            BindMode::Unix => self.socket.clone().map(BindTarget::Unix),
            BindMode::Tcp => match (&self.host, self.port) {
                (Some(host), Some(port)) => Some(BindTarget::Tcp {
                    host: host.clone(),
                    port,
                }),
                _ => None,
            },
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS (tcp mode only).
    pub enable: bool,

    /// PEM file holding certificate chain and private key.
    pub certificate: Option<PathBuf>,

    /// Host-specific PEM file, preferred over `certificate` when set.
    pub fqdn_certificate: Option<PathBuf>,

    /// Client certificate authentication.
    pub client_auth: ClientAuthConfig,
}

impl TlsConfig {
    /// Path the server certificate/key pair is loaded from.
    pub fn effective_certificate(&self) -> Option<&PathBuf> {
        self.fqdn_certificate.as_ref().or(self.certificate.as_ref())
    }
}

/// Client certificate policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientAuthConfig {
    pub enable: bool,
    /// Reject clients without a certificate instead of merely asking.
    pub force: bool,
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Hex secret for signed tokens. Generated on first start when empty.
    pub secret: String,

    /// Users file (TOML).
    pub users_file: PathBuf,

    /// Allow sudo-style elevation to `root`.
    pub allow_sudo: bool,

    /// User logged in automatically with `--autologin`.
    pub autologin_user: String,

    /// Delay applied after a failed authentication attempt, in seconds.
    pub failure_delay_secs: u64,

    /// Lifetime of password reset tokens, in seconds.
    pub reset_token_max_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            users_file: PathBuf::from("/etc/panel-gateway/users.toml"),
            allow_sudo: false,
            autologin_user: "root".to_string(),
            failure_delay_secs: 3,
            reset_token_max_age_secs: 900,
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable spawned for workers. Defaults to the current executable.
    pub executable: Option<PathBuf>,

    /// Directory for per-worker sockets.
    pub runtime_dir: PathBuf,

    /// Account the restricted (anonymous) worker runs as when master is root.
    pub restricted_user: String,

    /// How long to wait for a new worker to accept connections.
    pub start_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            runtime_dir: std::env::temp_dir().join("panel-gateway"),
            restricted_user: "nobody".to_string(),
            start_timeout_secs: 10,
            terminate_grace_ms: 2000,
        }
    }
}

/// Gateway loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// Interval of the idle session vacuum.
    pub vacuum_interval_secs: u64,

    /// Time in-flight connections get to finish after the loop is stopped.
    pub drain_timeout_secs: u64,

    /// Request timeout for plain HTTP exchanges.
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            vacuum_interval_secs: 10,
            drain_timeout_secs: 5,
            request_timeout_secs: 120,
            max_body_size: 16 * 1024 * 1024,
        }
    }
}

/// Framed transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Long-poll hold time.
    pub poll_timeout_secs: u64,

    /// Polling channels unused for this long are dropped.
    pub poll_idle_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 20,
            poll_idle_secs: 60,
        }
    }
}

/// Plugin discovery configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directories whose subdirectories holding a `plugin.toml` are loaded.
    pub dirs: Vec<PathBuf>,
}

/// Outgoing mail configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enable: bool,
    /// Directory reset notifications are written to (one file per mail).
    pub outbox: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_tcp() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.bind.target(),
            Some(BindTarget::Tcp {
                host: "0.0.0.0".into(),
                port: 8000
            })
        );
        assert_eq!(config.session_max_time(), 3600);
    }

    #[test]
    fn fqdn_certificate_falls_back_to_base() {
        let mut tls = TlsConfig {
            enable: true,
            certificate: Some(PathBuf::from("/etc/panel/cert.pem")),
            ..Default::default()
        };
        assert_eq!(
            tls.effective_certificate(),
            Some(&PathBuf::from("/etc/panel/cert.pem"))
        );

        tls.fqdn_certificate = Some(PathBuf::from("/etc/panel/host.pem"));
        assert_eq!(
            tls.effective_certificate(),
            Some(&PathBuf::from("/etc/panel/host.pem"))
        );
    }

    #[test]
    fn parses_minimal_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            name = "box"
            [bind]
            mode = "unix"
            socket = "/run/panel.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "box");
        assert_eq!(
            config.bind.target(),
            Some(BindTarget::Unix(PathBuf::from("/run/panel.sock")))
        );
        assert_eq!(config.auth.failure_delay_secs, 3);
    }

    #[test]
    fn zero_session_max_time_uses_default() {
        let config = GatewayConfig {
            session_max_time: 0,
            ..Default::default()
        };
        assert_eq!(config.session_max_time(), DEFAULT_SESSION_MAX_TIME);
    }
}
