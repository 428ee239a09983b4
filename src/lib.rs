//! Process and connection gateway for a web administration panel.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod gate;
pub mod lifecycle;
pub mod mail;
pub mod net;
pub mod observability;
pub mod plugins;
pub mod session;
pub mod worker;

pub use config::GatewayConfig;
pub use context::{AppContext, RunMode};
pub use gate::{Gateway, ServeOutcome};
pub use lifecycle::Supervisor;
