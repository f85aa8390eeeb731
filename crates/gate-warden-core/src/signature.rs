//! HMAC-SHA256 verification of inbound webhook notifications.
//!
//! The quality server signs each notification by computing an HMAC-SHA256
//! digest of the raw request body, keyed with the webhook secret configured
//! on the server side, and sends the hex-encoded digest in the
//! `X-Sonar-Webhook-HMAC-SHA256` header.
//!
//! Verification is a pure function of `(signature, payload, secret)`. When
//! no secret is configured for an analysis the caller skips verification
//! entirely and trusts the notification unconditionally, an explicit
//! weaker mode, decided by [`crate::wait::QualityGateWaitStep`], never
//! silently inside this module.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

/// Validate a received signature against the payload and shared secret.
///
/// The signature is the hex encoding of `HMAC-SHA256(secret, payload)`;
/// upper- and lower-case hex are both accepted. Comparison of the decoded
/// digest is constant-time. A signature that is not valid hex, or whose
/// length does not match a SHA-256 digest, is rejected.
///
/// A mismatch is a hard authentication failure: callers must discard the
/// notification's contents unread.
pub fn is_valid(signature: &str, payload: &[u8], secret: &str) -> bool {
    let received = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            debug!("Received webhook signature is not valid hex");
            return false;
        }
    };

    // An empty secret is still a usable HMAC key; new_from_slice only fails
    // for keys longer than the algorithm allows, which SHA-256 never is.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    received.ct_eq(expected.as_slice()).into()
}
