//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex>[,v1=<hex>...]`, where each `v1`
//! is HMAC-SHA256 over `"{t}.{payload}"` keyed with the endpoint secret.
//! Several `v1` entries appear while a secret is being rolled.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SettlementError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str, now_unix: i64) -> Result<(), SettlementError> {
        verify_signature(payload, header, &self.secret, self.tolerance_secs, now_unix)
    }
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SettlementError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SettlementError::SignatureVerificationFailed("invalid timestamp".to_string())
                })?);
            }
            "v1" => {
                // Entries that are not hex can never match; skip them.
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        SettlementError::SignatureVerificationFailed("missing timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(SettlementError::SignatureVerificationFailed(
            "missing v1 signature".to_string(),
        ));
    }

    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SettlementError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SettlementError::SignatureVerificationFailed(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Checks the header against the raw body. Comparison is constant-time.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SettlementError> {
    if header.trim().is_empty() {
        return Err(SettlementError::SignatureVerificationFailed(
            "missing signature header".to_string(),
        ));
    }
    let parsed = parse_header(header)?;

    if (now_unix - parsed.timestamp).abs() > tolerance_secs {
        return Err(SettlementError::SignatureVerificationFailed(
            "timestamp outside tolerance".to_string(),
        ));
    }

    for candidate in &parsed.signatures {
        let mac = mac_for(secret, parsed.timestamp, payload)?;
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }

    Err(SettlementError::SignatureVerificationFailed(
        "no matching signature".to_string(),
    ))
}

/// Produces a header value for `payload`; used by tests and local tooling.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SettlementError> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}
