//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber for master and workers
//! - Pick the filter from `RUST_LOG`, the `-d` switch or the config
//!
//! # Design Decisions
//! - `RUST_LOG` wins when set, so operators can debug a single module
//! - `-d` raises this crate and `tower_http` to debug; the flag is
//!   dropped on a restart, and so is the verbosity

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: &str, debug: bool) -> String {
    if debug {
        "panel_gateway=debug,tower_http=debug".to_string()
    } else {
        format!("panel_gateway={level}")
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: &str, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(level, debug).into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
