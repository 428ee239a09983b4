//! Process-wide application context shared by master and workers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::GatewayConfig;

/// Command-line switches that change runtime behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunMode {
    /// `-d`: debug logging. Dropped on re-exec restart.
    pub debug: bool,
    /// `--dev`: development mode.
    pub dev: bool,
    /// `--autologin`: every client is logged in as the autologin user.
    pub autologin: bool,
}

/// Configuration plus where it came from.
#[derive(Debug)]
pub struct AppContext {
    pub config: GatewayConfig,
    pub config_path: PathBuf,
    pub mode: RunMode,
}

impl AppContext {
    pub fn new(config: GatewayConfig, config_path: impl Into<PathBuf>, mode: RunMode) -> Arc<Self> {
        Arc::new(Self {
            config,
            config_path: config_path.into(),
            mode,
        })
    }

    /// Effective session idle window in seconds.
    pub fn session_max_time(&self) -> u64 {
        self.config.session_max_time()
    }

    /// Executable spawned for workers.
    pub fn worker_executable(&self) -> std::io::Result<PathBuf> {
        match &self.config.worker.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe(),
        }
    }
}
