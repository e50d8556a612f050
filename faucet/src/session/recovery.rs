/// Signed recovery / claim tokens
///
/// `base64(json(fields)) | base64(hmac_sha256(secret, base64_payload))`

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Recoverable fields of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub id: String,
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "targetAddr")]
    pub target_addr: String,
    pub preimage: String,
    #[serde(with = "amount_string")]
    pub balance: u128,
    pub nonce: u64,
    pub claimable: bool,
}

impl RecoveryInfo {
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.start_time
    }
}

/// Balances travel as decimal strings
mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[derive(Clone)]
pub struct TokenSigner {
    keyed: HmacSha256,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSigner(..)")
    }
}

impl TokenSigner {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid token secret: {}", e))?;
        Ok(Self { keyed })
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(payload.as_bytes());
        mac
    }

    pub fn sign(&self, info: &RecoveryInfo) -> String {
        let json = serde_json::to_vec(info).unwrap_or_default();
        let payload = STANDARD.encode(json);
        let signature = STANDARD.encode(self.mac(&payload).finalize().into_bytes());
        format!("{}|{}", payload, signature)
    }

    /// Check signature and decode; does not look at age
    pub fn verify(&self, token: &str) -> Result<RecoveryInfo, TokenError> {
        let (payload, signature) = token.split_once('|').ok_or(TokenError::Malformed)?;
        if payload.is_empty() {
            return Err(TokenError::Malformed);
        }
        let signature = STANDARD.decode(signature).map_err(|_| TokenError::BadSignature)?;
        self.mac(payload)
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let json = STANDARD.decode(payload).map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)
    }

    /// Verify and reject tokens whose session started more than `max_age` seconds ago
    pub fn verify_fresh(&self, token: &str, max_age: u64, now: i64) -> Result<RecoveryInfo, TokenError> {
        let info = self.verify(token)?;
        if max_age > 0 && info.age_secs(now) > max_age as i64 {
            return Err(TokenError::Expired);
        }
        Ok(info)
    }
}
