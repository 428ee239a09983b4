//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, normalize bind scheme, generate secret)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc<AppContext> to all subsystems
//!
//! Users file:
//!     watcher.rs detects change
//!     → auth::users reloads
//!     → atomic swap of Arc<UsersFile>
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a master restart
//! - All fields have defaults to allow minimal configs
//! - Workers re-read the same file the master was started with

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AuthConfig, BindConfig, BindMode, BindTarget, ClientAuthConfig, GatewayConfig, TlsConfig,
    WorkerConfig,
};
