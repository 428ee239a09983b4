//! Authentication error types.

/// Failure to authenticate with username and password.
///
/// Deliberately carries no detail about which credential was wrong.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Failure of a sudo-style elevation that is not a plain wrong password.
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("Sudo is not allowed")]
    Disabled,
    #[error("User {0} is not allowed to use sudo")]
    NotPermitted(String),
}

/// Rejection of a signed, time-limited token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Signature age {age} > {max_age} seconds")]
    Expired { age: u64, max_age: u64 },
    #[error("Signature does not match")]
    BadSignature,
    #[error("Malformed token")]
    Malformed,
    #[error("Could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Invalid signing key")]
    InvalidKey,
}

impl TokenError {
    /// Short kind name reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::Expired { .. } => "SignatureExpired",
            TokenError::BadSignature | TokenError::Malformed => "BadTimeSignature",
            TokenError::Encode(_) => "EncodeError",
            TokenError::InvalidKey => "KeyError",
        }
    }
}
