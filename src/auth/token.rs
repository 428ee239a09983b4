//! Signed, time-limited tokens for password reset links.
//!
//! Format: `<payload>.<timestamp>.<signature>`, each segment URL-safe
//! base64 without padding. The signature is HMAC-SHA256 over the first
//! two segments, keyed by the configured secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

use crate::auth::error::TokenError;
use crate::session::unix_now;

type HmacSha256 = Hmac<Sha256>;

const SALT: &[u8] = b"panel-gateway.reset-token";

/// Signs and verifies reset tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self, signed: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| TokenError::InvalidKey)?;
        mac.update(SALT);
        mac.update(signed.as_bytes());
        Ok(mac)
    }

    /// Sign `value` with the current time.
    pub fn dumps<T: Serialize>(&self, value: &T) -> Result<String, TokenError> {
        self.dumps_at(value, unix_now() as u64)
    }

    /// Sign `value` as if issued at `timestamp`.
    pub fn dumps_at<T: Serialize>(&self, value: &T, timestamp: u64) -> Result<String, TokenError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?);
        let ts = URL_SAFE_NO_PAD.encode(timestamp.to_be_bytes());
        let signed = format!("{payload}.{ts}");
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&signed)?.finalize().into_bytes());
        Ok(format!("{signed}.{signature}"))
    }

    /// Verify `token` and decode its payload if younger than `max_age` seconds.
    pub fn loads<T: DeserializeOwned>(&self, token: &str, max_age: u64) -> Result<T, TokenError> {
        self.loads_at(token, max_age, unix_now() as u64)
    }

    pub fn loads_at<T: DeserializeOwned>(
        &self,
        token: &str,
        max_age: u64,
        now: u64,
    ) -> Result<T, TokenError> {
        let (signed, signature) = token.rsplit_once('.').ok_or(TokenError::BadSignature)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::BadSignature)?;
        self.mac(signed)?
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let (payload, ts) = signed.split_once('.').ok_or(TokenError::Malformed)?;
        let ts: [u8; 8] = URL_SAFE_NO_PAD
            .decode(ts)
            .map_err(|_| TokenError::Malformed)?
            .try_into()
            .map_err(|_| TokenError::Malformed)?;
        let age = now.saturating_sub(u64::from_be_bytes(ts));
        if age > max_age {
            return Err(TokenError::Expired { age, max_age });
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)
    }
}
