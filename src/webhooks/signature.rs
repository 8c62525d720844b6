//! Webhook signature verification using HMAC-SHA256.
//!
//! The task tracker signs each webhook delivery with HMAC-SHA256 over the
//! exact raw body bytes, using the shared secret configured when the webhook
//! was registered. The signature arrives in the `X-Signature` header as a
//! plain hex digest (no algorithm prefix).
//!
//! Verification is the first step in webhook processing; requests with an
//! invalid or missing signature are rejected before any parsing occurs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses an `X-Signature` header (a plain hex digest) into raw bytes.
///
/// Returns `None` for non-hex or odd-length headers. Never panics.
///
/// # Examples
///
/// ```
/// use rollup_bot::webhooks::parse_signature_header;
///
/// assert!(parse_signature_header("abcd1234").is_some());
/// assert!(parse_signature_header("xyz").is_none());
/// assert!(parse_signature_header("abc").is_none()); // odd length
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// This is useful for testing purposes (generating expected signatures).
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature the way the source puts it in the `X-Signature`
/// header: lowercase hex, no prefix.
pub fn format_signature_header(signature: &[u8]) -> String {
    hex::encode(signature)
}

/// Verifies a webhook signature against the payload and secret.
///
/// Returns `true` if the signature is valid, `false` otherwise.
/// Uses constant-time comparison to prevent timing attacks.
///
/// # Arguments
///
/// * `payload` - The raw webhook payload bytes, exactly as received
/// * `signature_header` - The value of the `X-Signature` header
/// * `secret` - The shared webhook secret
///
/// # Examples
///
/// ```
/// use rollup_bot::webhooks::{verify_signature, compute_signature, format_signature_header};
///
/// let payload = b"{\"event\":\"taskUpdated\"}";
/// let secret = b"webhook-secret";
///
/// let header = format_signature_header(&compute_signature(payload, secret));
/// assert!(verify_signature(payload, &header, secret));
/// assert!(!verify_signature(payload, &header, b"other-secret"));
/// ```
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
