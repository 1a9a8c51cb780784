//! Billing webhook signature verification.
//!
//! The processor sends a header of the form
//!
//! ```text
//! billing-signature: t=1717171717,v1=5257a869...,v1=9f0c...
//! ```
//!
//! where each `v1` is a hex HMAC-SHA256 of `"{t}.{raw body}"` keyed by the
//! shared webhook secret. Multiple `v1` entries appear while a secret is
//! being rotated; any one matching is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{LedgerError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "billing-signature";

/// Check `header` against `payload`. `now` and `tolerance_secs` bound how
/// old the signed timestamp may be, which limits replay of captured payloads.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| {
                    LedgerError::Signature("malformed timestamp".to_string())
                })?)
            }
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| LedgerError::Signature("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(LedgerError::Signature("no v1 signature present".to_string()));
    }
    if now.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        return Err(LedgerError::Signature(format!(
            "timestamp {timestamp} outside tolerance"
        )));
    }

    let matched = candidates.iter().any(|candidate| {
        let mac = keyed(secret, timestamp, payload);
        // verify_slice compares in constant time
        mac.verify_slice(candidate).is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err(LedgerError::Signature("signature mismatch".to_string()))
    }
}

/// Produce a header value for `payload`.
#[cfg(test)]
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mac = keyed(secret, timestamp, payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

fn keyed(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC key of any length is valid"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}
