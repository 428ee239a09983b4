//! Session registry.
//!
//! # Responsibilities
//! - Map session keys to identity and last-activity timestamps
//! - Compute remaining idle time
//! - Vacuum sessions whose idle window elapsed
//!
//! # Design Decisions
//! - `DashMap` gives per-key locking; no global lock is held
//! - The master owns the authoritative registry; each worker keeps a
//!   replica refreshed from headers the gate attaches to every request
//! - Timestamps are UNIX seconds (`f64`) so they can cross process
//!   boundaries unchanged

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as UNIX seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Opaque session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    const RESTRICTED: &'static str = "restricted";

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Key of the shared worker serving anonymous requests.
    pub fn restricted() -> Self {
        Self(Self::RESTRICTED.to_string())
    }

    pub fn is_restricted(&self) -> bool {
        self.0 == Self::RESTRICTED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are credentials; only a prefix goes to logs.
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{prefix}")
    }
}

/// One authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub user: String,
    pub elevated: bool,
    /// Last activity, UNIX seconds.
    pub timestamp: f64,
}

impl Session {
    /// Whole seconds left before the idle window closes at `now`.
    pub fn remaining(&self, max_time: u64, now: f64) -> i64 {
        (self.timestamp + max_time as f64 - now) as i64
    }

    pub fn is_expired(&self, max_time: u64, now: f64) -> bool {
        self.timestamp + max_time as f64 <= now
    }
}

/// Process-wide session table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionKey, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a session for `user`.
    pub fn create(&self, user: &str, elevated: bool) -> Session {
        let session = Session {
            key: SessionKey::generate(),
            user: user.to_string(),
            elevated,
            timestamp: unix_now(),
        };
        self.sessions.insert(session.key.clone(), session.clone());
        tracing::debug!(session = %session.key, user = %user, elevated, "Session created");
        session
    }

    /// Insert or replace a session as-is.
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.key.clone(), session);
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Refresh the activity timestamp. Returns `false` for unknown keys.
    pub fn touch(&self, key: &SessionKey) -> bool {
        self.touch_at(key, unix_now())
    }

    /// Set the activity timestamp to `timestamp` if it moves forward.
    pub fn touch_at(&self, key: &SessionKey, timestamp: f64) -> bool {
        match self.sessions.get_mut(key) {
            Some(mut session) => {
                if timestamp > session.timestamp {
                    session.timestamp = timestamp;
                }
                true
            }
            None => false,
        }
    }

    /// Touch `key` unless its idle window already closed.
    ///
    /// Expired sessions stay expired until vacuumed.
    pub fn refresh(&self, key: &SessionKey, max_time: u64) -> bool {
        let now = unix_now();
        match self.sessions.get_mut(key) {
            Some(mut session) if !session.is_expired(max_time, now) => {
                session.timestamp = session.timestamp.max(now);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    /// Seconds remaining for `key`; unknown keys count from the epoch.
    pub fn remaining(&self, key: &SessionKey, max_time: u64) -> i64 {
        let timestamp = self.get(key).map(|s| s.timestamp).unwrap_or(0.0);
        (timestamp + max_time as f64 - unix_now()) as i64
    }

    /// Remove and return every session idle for longer than `max_time`.
    pub fn vacuum(&self, max_time: u64) -> Vec<Session> {
        let now = unix_now();
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(max_time, now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.sessions.remove_if(&key, |_, s| s.is_expired(max_time, now)))
            .map(|(_, s)| s)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_url_safe() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);
        assert!(a
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!a.is_restricted());
        assert!(SessionKey::restricted().is_restricted());
    }

    #[test]
    fn expired_session_has_non_positive_remaining_time() {
        let registry = SessionRegistry::new();
        let mut session = registry.create("bob", false);
        session.timestamp = unix_now() - 3601.0;
        registry.insert(session.clone());

        assert!(registry.remaining(&session.key, 3600) <= 0);
        assert!(session.remaining(3600, unix_now()) <= 0);
    }

    #[test]
    fn fresh_session_has_nearly_full_window() {
        let registry = SessionRegistry::new();
        let session = registry.create("bob", false);
        let remaining = registry.remaining(&session.key, 3600);
        assert!((3598..=3600).contains(&remaining), "{remaining}");
    }

    #[test]
    fn unknown_key_is_long_expired() {
        let registry = SessionRegistry::new();
        assert!(registry.remaining(&SessionKey::from("nope"), 3600) < 0);
    }

    #[test]
    fn touch_only_moves_forward() {
        let registry = SessionRegistry::new();
        let session = registry.create("bob", false);

        assert!(registry.touch_at(&session.key, session.timestamp - 100.0));
        assert_eq!(registry.get(&session.key).unwrap().timestamp, session.timestamp);

        assert!(registry.touch_at(&session.key, session.timestamp + 5.0));
        assert_eq!(
            registry.get(&session.key).unwrap().timestamp,
            session.timestamp + 5.0
        );
        assert!(!registry.touch(&SessionKey::from("nope")));
    }

    #[test]
    fn refresh_does_not_revive_expired_sessions() {
        let registry = SessionRegistry::new();
        let mut session = registry.create("bob", false);
        session.timestamp -= 3601.0;
        registry.insert(session.clone());

        assert!(!registry.refresh(&session.key, 3600));
        assert!(registry.remaining(&session.key, 3600) <= 0);

        let live = registry.create("alice", false);
        assert!(registry.refresh(&live.key, 3600));
    }

    #[test]
    fn vacuum_removes_only_idle_sessions() {
        let registry = SessionRegistry::new();
        let live = registry.create("alice", false);
        let mut idle = registry.create("bob", false);
        idle.timestamp -= 7200.0;
        registry.insert(idle.clone());

        let removed = registry.vacuum(3600);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user, "bob");
        assert!(registry.contains(&live.key));
        assert!(!registry.contains(&idle.key));
    }
}
