//! Webhook signature verification.
//!
//! Senders sign the raw request body with HMAC-SHA256 over a shared secret
//! and put the hex digest in a header. Verification is constant-time. When
//! no secret is configured for a source, verification is bypassed
//! (development mode).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 digest of `payload` under `secret`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        // HMAC accepts keys of any length; this branch is unreachable.
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a webhook signature against the raw body.
///
/// Returns `true` when no secret is configured. A configured secret with a
/// missing or malformed header fails closed.
pub fn verify_signature(secret: Option<&str>, payload: &[u8], provided: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };

    let Some(provided) = provided else {
        warn!("webhook signature missing while a secret is configured");
        return false;
    };

    // Some senders prefix the hex digest with the algorithm name.
    let digest_hex = provided.trim().trim_start_matches("sha256=");
    let Ok(digest) = hex::decode(digest_hex) else {
        warn!("webhook signature is not valid hex");
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&digest).is_ok()
}
