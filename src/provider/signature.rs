//! Webhook signature verification.
//!
//! The provider signs every callback with HMAC-SHA256 over a canonical
//! string: each present top-level body field rendered as `key=value`, plus
//! the `merchant_id`, `timestamp` and `nonce` header values, pairs sorted
//! byte-wise by key and joined with `&`. The encoding and sort order have to
//! match the provider bit for bit or every request fails verification.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_MERCHANT_ID: &str = "x-merchant-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGN: &str = "x-sign";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("unknown merchant id")]
    UnknownMerchant,
    #[error("malformed request")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid signing key")]
    BadKey,
}

/// The four auth headers every callback must carry.
#[derive(Debug, Clone)]
pub struct CallbackHeaders {
    pub merchant_id: String,
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl CallbackHeaders {
    pub fn from_header_map(headers: &axum::http::HeaderMap) -> Result<Self, SignatureError> {
        let get = |name: &'static str| -> Result<String, SignatureError> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(SignatureError::MissingHeader(name))
        };
        Ok(Self {
            merchant_id: get(HEADER_MERCHANT_ID)?,
            timestamp: get(HEADER_TIMESTAMP)?,
            nonce: get(HEADER_NONCE)?,
            signature: get(HEADER_SIGN)?,
        })
    }
}

#[derive(Clone)]
pub struct SignatureVerifier {
    merchant_id: String,
    secret: String,
}

// The secret stays out of logs and debug output.
impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("merchant_id", &self.merchant_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(merchant_id: &str, secret: &str) -> Self {
        Self {
            merchant_id: merchant_id.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Lowercase-hex HMAC-SHA256 over the canonical string for `body`.
    pub fn sign(
        &self,
        body: &Value,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String, SignatureError> {
        let canonical = canonical_string(body, &self.merchant_id, timestamp, nonce)
            .ok_or(SignatureError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::BadKey)?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check the `x-sign` header against the raw request bytes. Runs before
    /// any typed parse so that an attacker cannot smuggle fields a lenient
    /// deserializer would drop.
    pub fn verify(
        &self,
        headers: &CallbackHeaders,
        raw_body: &[u8],
    ) -> Result<Value, SignatureError> {
        if headers.merchant_id != self.merchant_id {
            return Err(SignatureError::UnknownMerchant);
        }
        let body: Value =
            serde_json::from_slice(raw_body).map_err(|_| SignatureError::Malformed)?;
        let canonical = canonical_string(&body, &self.merchant_id, &headers.timestamp, &headers.nonce)
            .ok_or(SignatureError::Malformed)?;
        let sig_bytes =
            hex::decode(headers.signature.trim()).map_err(|_| SignatureError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::BadKey)?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| SignatureError::Mismatch)?;
        Ok(body)
    }
}

/// Canonical `k=v&k=v` string. Returns None when the body is not a JSON
/// object. Null fields count as absent; everything else is rendered in its
/// JSON serialized form, strings without quotes.
fn canonical_string(
    body: &Value,
    merchant_id: &str,
    timestamp: &str,
    nonce: &str,
) -> Option<String> {
    let obj = body.as_object()?;
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in obj {
        let rendered = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            // Arrays and nested objects ride along in compact JSON.
            other => serde_json::to_string(other).ok()?,
        };
        params.insert(key.clone(), rendered);
    }
    params.insert("merchant_id".to_string(), merchant_id.to_string());
    params.insert("timestamp".to_string(), timestamp.to_string());
    params.insert("nonce".to_string(), nonce.to_string());

    let joined = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    Some(joined)
}
