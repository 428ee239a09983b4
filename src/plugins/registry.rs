//! Plugin registry.
//!
//! # Responsibilities
//! - Hold explicitly registered HTTP plugins, socket endpoints and
//!   sidebar providers
//! - Discover content plugins (`plugin.toml` + static files) on disk
//! - Answer resource, locale and sidebar queries across plugins
//!
//! # Design Decisions
//! - No reflection or global interface discovery: code plugins are
//!   registered by explicit calls at worker startup
//! - Content plugins carry no code, only a manifest and files

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use crate::plugins::sidebar::{SidebarItem, SidebarProvider};
use crate::worker::runtime::{WorkerContext, WorkerState};

/// File marking a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Translation template excluded from the language list.
const LOCALE_TEMPLATE: &str = "app.pot";

/// A plugin contributing HTTP endpoints to workers.
pub trait HttpPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn routes(&self) -> Router<WorkerState>;
}

/// Receives framed messages addressed to a plugin.
pub trait SocketEndpoint: Send + Sync {
    fn plugin(&self) -> &str;
    /// Handle one message; returned values are sent back to the client.
    fn on_message(&self, ctx: &WorkerContext, data: Value) -> Vec<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("plugin {0} is already registered")]
    Duplicate(String),
}

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sidebar: Vec<SidebarItem>,
    /// Directory the manifest was loaded from.
    #[serde(skip)]
    pub path: PathBuf,
}

impl PluginManifest {
    pub fn load(dir: &Path) -> Result<Self, PluginLoadError> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| PluginLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let mut manifest: Self = toml::from_str(&content)
            .map_err(|source| PluginLoadError::Manifest { path, source })?;
        manifest.path = dir.to_path_buf();
        Ok(manifest)
    }
}

struct ManifestSidebar(Vec<SidebarItem>);

impl SidebarProvider for ManifestSidebar {
    fn items(&self) -> Vec<SidebarItem> {
        self.0.clone()
    }
}

/// Everything a worker knows about its plugins.
#[derive(Default)]
pub struct PluginRegistry {
    manifests: BTreeMap<String, PluginManifest>,
    http: Vec<Arc<dyn HttpPlugin>>,
    sockets: HashMap<String, Arc<dyn SocketEndpoint>>,
    sidebar: Vec<Arc<dyn SidebarProvider>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_http(&mut self, plugin: Arc<dyn HttpPlugin>) {
        tracing::debug!(plugin = plugin.id(), "Registered HTTP plugin");
        self.http.push(plugin);
    }

    pub fn register_socket(&mut self, endpoint: Arc<dyn SocketEndpoint>) {
        self.sockets.insert(endpoint.plugin().to_string(), endpoint);
    }

    pub fn register_sidebar(&mut self, provider: Arc<dyn SidebarProvider>) {
        self.sidebar.push(provider);
    }

    pub fn register_manifest(&mut self, manifest: PluginManifest) -> Result<(), PluginLoadError> {
        if self.manifests.contains_key(&manifest.name) {
            return Err(PluginLoadError::Duplicate(manifest.name));
        }
        if !manifest.sidebar.is_empty() {
            self.register_sidebar(Arc::new(ManifestSidebar(manifest.sidebar.clone())));
        }
        tracing::debug!(plugin = %manifest.name, path = %manifest.path.display(), "Loaded plugin");
        self.manifests.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    /// Load every subdirectory of `dir` holding a manifest.
    ///
    /// Broken plugins are reported and skipped.
    pub fn load_dir(&mut self, dir: &Path) -> Vec<PluginLoadError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                return vec![PluginLoadError::Io {
                    path: dir.to_path_buf(),
                    source,
                }]
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();

        dirs.iter()
            .filter_map(|path| {
                PluginManifest::load(path)
                    .and_then(|manifest| self.register_manifest(manifest))
                    .err()
            })
            .collect()
    }

    pub fn http_plugins(&self) -> impl Iterator<Item = &Arc<dyn HttpPlugin>> {
        self.http.iter()
    }

    pub fn socket(&self, plugin: &str) -> Option<Arc<dyn SocketEndpoint>> {
        self.sockets.get(plugin).cloned()
    }

    /// Content directory of `plugin`, if it was loaded from disk.
    pub fn content_dir(&self, plugin: &str) -> Option<&Path> {
        self.manifests.get(plugin).map(|m| m.path.as_path())
    }

    pub fn manifests(&self) -> impl Iterator<Item = &PluginManifest> {
        self.manifests.values()
    }

    /// Flat list of every provider's sidebar items.
    pub fn sidebar_items(&self) -> Vec<SidebarItem> {
        self.sidebar.iter().flat_map(|p| p.items()).collect()
    }

    /// Sorted language codes available in any plugin's `locale` directory.
    pub fn languages(&self) -> Vec<String> {
        let mut languages = BTreeSet::new();
        for manifest in self.manifests.values() {
            let Ok(entries) = std::fs::read_dir(manifest.path.join("locale")) else {
                continue;
            };
            languages.extend(
                entries
                    .filter_map(Result::ok)
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter(|name| name != LOCALE_TEMPLATE),
            );
        }
        languages.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    #[test]
    fn loads_plugins_and_reports_broken_ones() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "dashboard",
            r#"
            name = "dashboard"
            title = "Dashboard"
            [[sidebar]]
            id = "dashboard"
            name = "Dashboard"
            url = "/view/dashboard"
            attach = "category:general"
            "#,
        );
        write_plugin(root.path(), "broken", "name = [");
        std::fs::create_dir_all(root.path().join("not-a-plugin")).unwrap();

        let mut registry = PluginRegistry::new();
        let errors = registry.load_dir(root.path());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], PluginLoadError::Manifest { .. }));
        assert_eq!(
            registry.content_dir("dashboard"),
            Some(root.path().join("dashboard").as_path())
        );
        assert_eq!(registry.sidebar_items().len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "a", "name = \"same\"");
        write_plugin(root.path(), "b", "name = \"same\"");
        let mut registry = PluginRegistry::new();
        let errors = registry.load_dir(root.path());
        assert!(matches!(&errors[..], [PluginLoadError::Duplicate(name)] if name == "same"));
    }

    #[test]
    fn languages_exclude_template() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "core", "name = \"core\"");
        for entry in ["en", "de", "app.pot", "fr"] {
            std::fs::create_dir_all(dir.join("locale").join(entry)).unwrap();
        }
        let mut registry = PluginRegistry::new();
        assert!(registry.load_dir(root.path()).is_empty());
        assert_eq!(registry.languages(), ["de", "en", "fr"]);
    }
}
