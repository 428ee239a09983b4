//! Worker → master directives.
//!
//! Workers cannot touch master state directly. They ask for effects by
//! adding `x-gate-directive` headers to their responses; the gate strips
//! and applies them before the response reaches the client.
//!
//! ```text
//! x-gate-directive: terminate
//! x-gate-directive: restart-master
//! x-gate-directive: touch
//! x-gate-directive: establish-session; user=bob; elevated=1
//! ```

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use url::form_urlencoded;

pub const DIRECTIVE_HEADER: HeaderName = HeaderName::from_static("x-gate-directive");

/// Client address as seen by the master.
pub const REMOTE_ADDR_HEADER: HeaderName = HeaderName::from_static("x-gate-remote-addr");

/// Session key the request was routed by.
pub const SESSION_KEY_HEADER: HeaderName = HeaderName::from_static("x-gate-session-key");

/// Last-activity timestamp of the requesting session.
pub const SESSION_TIMESTAMP_HEADER: HeaderName =
    HeaderName::from_static("x-gate-session-timestamp");

/// Prefix reserved for master ↔ worker headers.
pub const INTERNAL_PREFIX: &str = "x-gate-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Stop the worker that sent the response and drop its session.
    Terminate,
    /// Re-exec the master process.
    RestartMaster,
    /// Refresh the session's activity timestamp.
    Touch,
    /// Create a session for `user` and hand its cookie to the client.
    EstablishSession { user: String, elevated: bool },
}

impl Directive {
    pub fn encode(&self) -> HeaderValue {
        match self {
            Directive::Terminate => HeaderValue::from_static("terminate"),
            Directive::RestartMaster => HeaderValue::from_static("restart-master"),
            Directive::Touch => HeaderValue::from_static("touch"),
            Directive::EstablishSession { user, elevated } => {
                let user: String = form_urlencoded::byte_serialize(user.as_bytes()).collect();
                let value = format!(
                    "establish-session; user={user}; elevated={}",
                    u8::from(*elevated)
                );
                // Percent-encoding leaves only visible ASCII.
                HeaderValue::from_str(&value)
                    .unwrap_or_else(|_| HeaderValue::from_static("establish-session"))
            }
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';').map(str::trim);
        match parts.next()? {
            "terminate" => Some(Directive::Terminate),
            "restart-master" => Some(Directive::RestartMaster),
            "touch" => Some(Directive::Touch),
            "establish-session" => {
                let mut user = None;
                let mut elevated = false;
                for part in parts {
                    for (key, value) in form_urlencoded::parse(part.as_bytes()) {
                        match key.as_ref() {
                            "user" => user = Some(value.into_owned()),
                            "elevated" => elevated = value == "1",
                            _ => {}
                        }
                    }
                }
                user.filter(|u| !u.is_empty())
                    .map(|user| Directive::EstablishSession { user, elevated })
            }
            _ => None,
        }
    }

    /// Remove every directive header from `headers` and parse them.
    pub fn take_all(headers: &mut HeaderMap) -> Vec<Directive> {
        let values: Vec<HeaderValue> = headers.get_all(&DIRECTIVE_HEADER).iter().cloned().collect();
        headers.remove(&DIRECTIVE_HEADER);
        values
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| {
                let parsed = Directive::parse(v);
                if parsed.is_none() {
                    tracing::warn!(directive = %v, "Ignoring unknown worker directive");
                }
                parsed
            })
            .collect()
    }
}

/// Drop every client-supplied internal header.
pub fn strip_internal(headers: &mut HeaderMap) {
    let internal: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(INTERNAL_PREFIX))
        .cloned()
        .collect();
    for name in internal {
        headers.remove(&name);
    }
}
