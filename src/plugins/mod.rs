//! Plugin subsystem.
//!
//! # Data Flow
//! ```text
//! worker startup:
//!     core.rs CorePlugin ──register──┐
//!     plugins.dirs/*/plugin.toml ────┴→ registry.rs PluginRegistry
//!
//! worker request:
//!     /api/...         → HttpPlugin routes
//!     /resources/...   → resources.rs
//!     /socket frames   → SocketEndpoint by plugin name
//!     sidebar/navbox   → sidebar.rs build/search
//! ```

pub mod core;
pub mod registry;
pub mod resources;
pub mod sidebar;

use std::sync::Arc;

pub use registry::{HttpPlugin, PluginLoadError, PluginManifest, PluginRegistry, SocketEndpoint};
pub use sidebar::{SidebarItem, SidebarProvider};

use crate::config::schema::PluginsConfig;

/// Registry with the core plugin and every content plugin under `config.dirs`.
pub fn load(config: &PluginsConfig) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    let core = Arc::new(self::core::CorePlugin);
    registry.register_http(core.clone());
    registry.register_sidebar(core.clone());
    registry.register_socket(core);

    for dir in &config.dirs {
        for error in registry.load_dir(dir) {
            tracing::warn!(dir = %dir.display(), error = %error, "Plugin not loaded");
        }
    }
    registry
}
