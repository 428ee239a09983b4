//! Authentication subsystem.
//!
//! # Responsibilities
//! - Credential checks (`provider.rs`) against the users file (`users.rs`)
//! - Signed reset tokens (`token.rs`)
//! - Error taxonomy (`error.rs`)

pub mod error;
pub mod provider;
pub mod token;
pub mod users;

use serde::{Deserialize, Serialize};

pub use error::{AuthError, ElevationError, TokenError};
pub use provider::{AuthProvider, UsersFileProvider, ROOT_USER};
pub use token::TokenSigner;
pub use users::{hash_password, verify_password, UsersStore};

/// Who a worker acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    /// Obtained through sudo-style elevation.
    pub elevated: bool,
}

impl Identity {
    pub fn new(user: impl Into<String>, elevated: bool) -> Self {
        Self {
            user: user.into(),
            elevated,
        }
    }

    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }
}
