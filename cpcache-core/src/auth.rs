//! HMAC authentication for wanted-packages uploads.
//!
//! A request is accepted when its `Timestamp` header is fresh and its
//! `Authorization` header carries a hex-encoded HMAC-SHA256 over
//! `body || decimal(timestamp) || "\n"` computed with the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Timestamps this much behind the current time (in seconds) are stale.
pub const MAX_TIMESTAMP_AGE_SECS: u64 = 60;

fn mac_for(secret: &[u8], body: &[u8], timestamp: u64) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(body);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"\n");
    mac
}

/// Computes the hex signature a client must send for `body` at
/// `timestamp`. Exposed for client tooling and tests.
pub fn sign_body(secret: &[u8], body: &[u8], timestamp: u64) -> String {
    hex::encode(mac_for(secret, body, timestamp).finalize().into_bytes())
}

/// Verifies an upload signature.
///
/// Rejects stale timestamps before touching the MAC; the MAC comparison
/// itself is constant-time.
pub fn verify_signed_body(
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
    timestamp: u64,
    now: u64,
) -> bool {
    if now.saturating_sub(timestamp) >= MAX_TIMESTAMP_AGE_SECS {
        return false;
    }
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac_for(secret, body, timestamp)
        .verify_slice(&signature)
        .is_ok()
}
