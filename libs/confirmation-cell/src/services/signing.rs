use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::ConfirmationError;

type HmacSha256 = Hmac<Sha256>;

/// A serialized webhook body together with the signature over exactly
/// those bytes. The body is sent as-is, never re-serialized.
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub event: String,
    pub body: String,
    pub signature: String,
}

impl SignedPayload {
    pub fn new<T: Serialize>(event: &str, payload: &T, secret: &str) -> Result<Self, ConfirmationError> {
        let body = serde_json::to_string(payload)?;
        let signature = sign(secret, body.as_bytes())?;
        Ok(Self {
            event: event.to_string(),
            body,
            signature,
        })
    }
}

/// Lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, ConfirmationError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| ConfirmationError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(to_hex(&mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(expected) = from_hex(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 || !raw.is_ascii() {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}
