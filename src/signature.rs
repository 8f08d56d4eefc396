//! Inbound webhook signature verification.
//!
//! Linear signs each webhook delivery with an HMAC-SHA256 digest of the raw
//! request body, sent as a bare hex string in the `Linear-Signature` header.
//! Verification must happen against the raw bytes, before any JSON parsing.
//!
//! When no signing secret is configured, verification is skipped and every
//! request is accepted. This insecure mode is flagged with a single warning
//! per process lifetime so it is never silently indistinguishable from
//! "verified".

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::sync::Once;

/// Maximum accepted distance between a webhook timestamp and now, in seconds.
///
/// Deliveries older (or further in the future) than this are treated as
/// replays and rejected.
pub const MAX_TIMESTAMP_SKEW_SECS: u64 = 60;

static INSECURE_MODE_WARNING: Once = Once::new();

/// Verifies the HMAC-SHA256 signature of a raw webhook body.
///
/// Returns `true` when the signature matches, or when no secret is
/// configured (insecure mode, warned once). Returns `false` on a missing or
/// malformed header, wrong length, or mismatch. Never errors.
#[must_use]
pub fn verify(raw_body: &[u8], signature_header: Option<&str>, secret: &SecretString) -> bool {
    let secret = secret.expose_secret();
    if secret.is_empty() {
        INSECURE_MODE_WARNING.call_once(|| {
            tracing::warn!(
                "webhook secret not configured, accepting unsigned requests (insecure mode)"
            );
        });
        return true;
    }

    let Some(signature) = signature_header else {
        tracing::debug!("signature header missing");
        return false;
    };

    let expected = compute_signature(secret, raw_body);
    constant_time_eq(expected.as_bytes(), signature.trim().as_bytes())
}

/// Computes the hex-encoded HMAC-SHA256 signature of a raw body.
#[must_use]
pub fn compute_signature(secret: &str, raw_body: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;

    // HMAC-SHA256 accepts keys of any length, new_from_slice cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(raw_body);

    hex::encode(mac.finalize().into_bytes())
}

/// Checks a webhook timestamp (epoch milliseconds) against the replay window.
///
/// A missing timestamp is accepted for backwards compatibility with older
/// webhook payloads.
#[must_use]
pub fn fresh_timestamp(timestamp_ms: Option<i64>, now: DateTime<Utc>) -> bool {
    let Some(timestamp_ms) = timestamp_ms else {
        tracing::debug!("webhook timestamp missing, accepting");
        return true;
    };

    // The timestamp is attacker-controlled; the subtraction must not be
    // allowed to overflow. An out-of-range value is a rejection, not a
    // panic.
    let Some(diff_ms) = now.timestamp_millis().checked_sub(timestamp_ms) else {
        tracing::warn!(timestamp_ms, "webhook timestamp out of representable range");
        return false;
    };

    let skew_secs = diff_ms.unsigned_abs() / 1000;
    if skew_secs > MAX_TIMESTAMP_SKEW_SECS {
        tracing::warn!(skew_secs, "webhook timestamp outside replay window");
        return false;
    }
    true
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
