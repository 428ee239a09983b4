//! Users file storage.
//!
//! # Responsibilities
//! - Parse the TOML users file
//! - Hash and verify passwords
//! - Hot reload on change (notify + arc-swap)
//!
//! # Design Decisions
//! - A missing users file is an empty user list, not a startup failure
//! - Readers never block: the current file is swapped atomically

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::watcher::FileWatcher;

const HASH_SCHEME: &str = "sha256";

/// One entry of the users file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserEntry {
    /// `$sha256$<salt>$<hex digest>`.
    pub password: String,
    pub email: Option<String>,
    /// OS account the user's worker runs as when the master is root.
    pub uid: Option<u32>,
    /// May elevate to `root`.
    pub sudo: bool,
    pub permissions: BTreeMap<String, bool>,
    pub profile: serde_json::Map<String, serde_json::Value>,
}

/// Parsed users file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UsersFile {
    pub users: BTreeMap<String, UserEntry>,
}

impl UsersFile {
    /// Read and parse `path`. A missing file yields no users.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Users file not found, no users loaded");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, username: &str) -> Option<&UserEntry> {
        self.users.get(username)
    }

    /// Username owning `email`, if any.
    pub fn find_by_email(&self, email: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|(_, entry)| entry.email.as_deref() == Some(email))
            .map(|(name, _)| name.as_str())
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt: String = salt.iter().map(|b| format!("{b:02x}")).collect();
    format!("${HASH_SCHEME}${salt}${}", digest(&salt, password))
}

/// Compare `password` against a stored hash in constant time.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(""), Some(HASH_SCHEME), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let actual = digest(salt, password);
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Hot-reloadable users file.
pub struct UsersStore {
    path: PathBuf,
    current: Arc<ArcSwap<UsersFile>>,
    _watcher: Option<RecommendedWatcher>,
}

impl UsersStore {
    /// Load `path` once, without watching.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        Ok(Self {
            path: path.to_path_buf(),
            current: Arc::new(ArcSwap::from_pointee(UsersFile::load(path)?)),
            _watcher: None,
        })
    }

    /// An in-memory store, used by tests and autologin setups.
    pub fn from_file(users: UsersFile) -> Self {
        Self {
            path: PathBuf::new(),
            current: Arc::new(ArcSwap::from_pointee(users)),
            _watcher: None,
        }
    }

    /// Reload whenever the file changes on disk.
    pub fn watch(mut self) -> Self {
        if !self.path.exists() {
            return self;
        }
        let current = Arc::clone(&self.current);
        match FileWatcher::new(&self.path).run(move |path| match UsersFile::load(path) {
            Ok(users) => {
                tracing::info!(count = users.users.len(), "Users reloaded");
                current.store(Arc::new(users));
            }
            Err(e) => {
                tracing::error!("Failed to reload users: {}. Keeping current list.", e);
            }
        }) {
            Ok(watcher) => self._watcher = Some(watcher),
            Err(e) => tracing::warn!(error = %e, "Could not watch users file"),
        }
        self
    }

    /// Snapshot of the current users file.
    pub fn snapshot(&self) -> Arc<UsersFile> {
        self.current.load_full()
    }

    /// Re-read the file now.
    pub fn reload(&self) -> Result<(), std::io::Error> {
        self.current.store(Arc::new(UsersFile::load(&self.path)?));
        Ok(())
    }
}
