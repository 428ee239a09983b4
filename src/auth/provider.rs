//! Authentication provider.
//!
//! # Responsibilities
//! - Verify username/password pairs
//! - Verify sudo-style elevation to `root`
//! - Resolve profiles, permissions, e-mail owners and isolation uids
//!
//! Providers are plugged in behind [`AuthProvider`]; the gateway ships
//! with [`UsersFileProvider`] backed by the TOML users file.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::error::{AuthError, ElevationError};
use crate::auth::users::{verify_password, UsersStore};
use crate::config::AuthConfig;

/// Name of the superuser identity sudo elevates to.
pub const ROOT_USER: &str = "root";

/// Pluggable credential backend.
pub trait AuthProvider: Send + Sync {
    /// Short provider name, for logs.
    fn id(&self) -> &'static str;

    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// `Ok(false)` is a wrong password; `Err` is any other refusal.
    fn check_sudo_password(&self, username: &str, password: &str) -> Result<bool, ElevationError>;

    /// User owning `email`.
    fn check_mail(&self, email: &str) -> Option<String>;

    fn get_profile(&self, username: &str) -> Value;

    fn has_permission(&self, username: &str, permission: &str) -> bool;

    /// OS uid a worker for `username` should run as.
    fn isolation_uid(&self, username: &str) -> Option<u32>;
}

/// Provider backed by the users file.
pub struct UsersFileProvider {
    store: UsersStore,
    allow_sudo: bool,
}

impl UsersFileProvider {
    pub fn new(store: UsersStore, config: &AuthConfig) -> Self {
        Self {
            store,
            allow_sudo: config.allow_sudo,
        }
    }

    /// Load the configured users file and watch it for changes.
    pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn AuthProvider>, std::io::Error> {
        let store = UsersStore::load(&config.users_file)?.watch();
        Ok(Arc::new(Self::new(store, config)))
    }
}

impl AuthProvider for UsersFileProvider {
    fn id(&self) -> &'static str {
        "users"
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let users = self.store.snapshot();
        match users.get(username) {
            Some(entry) if verify_password(&entry.password, password) => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    fn check_sudo_password(&self, username: &str, password: &str) -> Result<bool, ElevationError> {
        if !self.allow_sudo {
            return Err(ElevationError::Disabled);
        }
        let users = self.store.snapshot();
        let Some(entry) = users.get(username) else {
            return Ok(false);
        };
        if !entry.sudo && username != ROOT_USER {
            return Err(ElevationError::NotPermitted(username.to_string()));
        }
        Ok(verify_password(&entry.password, password))
    }

    fn check_mail(&self, email: &str) -> Option<String> {
        self.store.snapshot().find_by_email(email).map(str::to_string)
    }

    fn get_profile(&self, username: &str) -> Value {
        self.store
            .snapshot()
            .get(username)
            .map(|entry| Value::Object(entry.profile.clone()))
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn has_permission(&self, username: &str, permission: &str) -> bool {
        if username == ROOT_USER {
            return true;
        }
        // Permissions default to granted unless explicitly revoked.
        self.store
            .snapshot()
            .get(username)
            .and_then(|entry| entry.permissions.get(permission).copied())
            .unwrap_or(true)
    }

    fn isolation_uid(&self, username: &str) -> Option<u32> {
        if username == ROOT_USER {
            return Some(0);
        }
        self.store.snapshot().get(username).and_then(|entry| entry.uid)
    }
}
