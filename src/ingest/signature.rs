//! Webhook signature verification using HMAC-SHA256.
//!
//! Marketplace A signs each webhook delivery with HMAC-SHA256 over the exact
//! request body bytes, using a shared secret. The signature arrives in the
//! `x-marketplace-signature` header as lowercase hex (no algorithm prefix).
//!
//! Verification runs against the raw bytes as received, before any JSON
//! parsing: re-serializing the body would normalize whitespace and break the
//! signature. Invalid signatures are rejected before any other processing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a signature header (lowercase or uppercase hex) into raw bytes.
///
/// Returns `None` for malformed headers (bad hex, odd length). Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// This is primarily useful in tests, for generating expected signatures.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as the header value Marketplace A sends: lowercase hex.
pub fn format_signature_header(signature: &[u8]) -> String {
    hex::encode(signature)
}

/// Verifies a webhook signature against the payload and secret.
///
/// Returns `true` if the signature is valid. Uses the HMAC library's
/// constant-time comparison, so the result depends only on equality and not
/// on the position of the first differing byte.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison via the HMAC library
    mac.verify_slice(&expected_signature).is_ok()
}
