//! Webhook payload signing.
//!
//! Outbound bodies are signed with HMAC-SHA256 over the raw bytes using the
//! destination's shared secret, sent as `X-Signature: sha256={hex}` plus an
//! `X-Timestamp` header. Verification recomputes the digest and compares in
//! constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value for a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Verify a received signature header against a body, in constant time.
pub fn verify(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
