use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Reasons an inbound webhook signature is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,

    #[error("signature timestamp {0} is outside the tolerance window")]
    TimestampOutsideTolerance(i64),

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

/// Compute the hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn sign_webhook_payload(
    secret: &str,
    timestamp: i64,
    payload: &str,
) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a `t=...,v1=...` header value, as the gateway sends it.
pub fn webhook_signature_header(
    secret: &str,
    timestamp: i64,
    payload: &str,
) -> Result<String, SignatureError> {
    let signature = sign_webhook_payload(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Verify a `t=...,v1=...[,v1=...]` signature header against the raw body.
///
/// Any `v1` entry may match (the gateway sends several while a secret is
/// being rolled). Comparison is constant time.
pub fn verify_webhook_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    if tolerance_secs > 0 && (now_unix - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutsideTolerance(timestamp));
    }

    let expected = sign_webhook_payload(secret, timestamp, payload)?;
    let expected_bytes = expected.as_bytes();

    let matched = candidates.iter().any(|candidate| {
        let candidate_bytes = candidate.as_bytes();
        candidate_bytes.len() == expected_bytes.len()
            && bool::from(expected_bytes.ct_eq(candidate_bytes))
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
