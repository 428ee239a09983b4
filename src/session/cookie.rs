//! Session cookie handling.

use axum::http::{header, HeaderMap, HeaderValue};

use crate::session::registry::SessionKey;

/// Name of the cookie carrying the session key.
pub const COOKIE_NAME: &str = "session";

/// Extract the session key from the request's `Cookie` headers.
pub fn session_from_headers(headers: &HeaderMap) -> Option<SessionKey> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == COOKIE_NAME && !value.is_empty())
        .map(|(_, value)| SessionKey::from(value))
}

/// `Set-Cookie` value establishing `key`.
pub fn set_cookie(key: &SessionKey, secure: bool) -> HeaderValue {
    let mut cookie = format!(
        "{COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Strict",
        key.as_str()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    // Keys are URL-safe base64, always a valid header value.
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| clear_cookie())
}

/// `Set-Cookie` value removing the session cookie.
pub fn clear_cookie() -> HeaderValue {
    HeaderValue::from_static("session=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
}
