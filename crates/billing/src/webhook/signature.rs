//! Stripe-compatible webhook signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex>[,v1=<hex>...]`, where each `v1`
//! is HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Name of the header carrying the signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Default allowed age of a signed payload, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("no timestamp in signature header")]
    MissingTimestamp,

    #[error("no v1 signature in signature header")]
    MissingSignature,

    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("timestamp outside the tolerance window")]
    OutsideTolerance,

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

/// Hex HMAC-SHA256 of `"<timestamp>.<body>"`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// A complete header value for `body`, as the gateway would send it.
pub fn signature_header(
    secret: &str,
    timestamp: i64,
    body: &[u8],
) -> Result<String, SignatureError> {
    Ok(format!("t={timestamp},v1={}", sign_payload(secret, timestamp, body)?))
}

/// Verifies `header` against `body`. Returns the signed timestamp.
pub fn verify_signature(
    header: &str,
    body: &[u8],
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<i64, SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed(part.trim().to_string()));
        };
        match name {
            "t" => {
                let t = value
                    .parse::<i64>()
                    .map_err(|_| SignatureError::Malformed(format!("timestamp {value:?}")))?;
                timestamp = Some(t);
            }
            "v1" => candidates.push(value),
            // Other schemes (v0 test signatures) are ignored.
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if candidates.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    // An age that does not fit in i64 is as stale as it gets.
    match now.checked_sub(timestamp) {
        Some(age) if age <= tolerance_secs => {}
        _ => return Err(SignatureError::OutsideTolerance),
    }

    let expected = sign_payload(secret, timestamp, body)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(timestamp)
    } else {
        Err(SignatureError::Mismatch)
    }
}
