use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::TpcError;
use crate::keys::KeyPair;

type HmacSha256 = Hmac<Sha256>;

/// Wire format version carried in every envelope.
pub const ENVELOPE_VERSION: u32 = 1;

/// Nonce length in bytes (hex-encoded to twice this).
pub const NONCE_LEN: usize = 16;

/// Authenticated unit of transport.
///
/// The payload is an opaque string; this layer never looks inside it.
/// Immutable once built: signing takes the envelope by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    pub version: u32,
    /// UUID v4.
    pub message_id: String,
    /// Creation time (Unix seconds).
    pub timestamp: u64,
    /// 128-bit random value, lowercase hex.
    pub nonce: String,
    pub source_agent: String,
    pub target_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_version: Option<u32>,
    pub payload: String,
}

impl Envelope {
    /// Create an envelope with a fresh message ID, nonce and timestamp.
    pub fn new(
        payload: impl Into<String>,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Self {
        EnvelopeBuilder::new(payload, source_agent, target_agent).build()
    }

    /// Canonical byte form: a JSON object with keys sorted by name.
    ///
    /// This is the only form that is ever signed or verified. Absent
    /// optional fields are omitted, not written as `null`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("version", Value::from(self.version));
        fields.insert("messageId", Value::from(self.message_id.as_str()));
        fields.insert("timestamp", Value::from(self.timestamp));
        fields.insert("nonce", Value::from(self.nonce.as_str()));
        fields.insert("sourceAgent", Value::from(self.source_agent.as_str()));
        fields.insert("targetAgent", Value::from(self.target_agent.as_str()));
        if let Some(cv) = self.compression_version {
            fields.insert("compressionVersion", Value::from(cv));
        }
        fields.insert("payload", Value::from(self.payload.as_str()));
        serde_json::to_vec(&fields).expect("canonical serialization of string/int map cannot fail")
    }

    /// True iff `0 <= now - timestamp <= max_age_secs`.
    pub fn is_fresh(&self, max_age_secs: u64) -> bool {
        self.is_fresh_at(max_age_secs, now_secs())
    }

    /// `is_fresh` against an explicit clock. Future timestamps are rejected.
    pub fn is_fresh_at(&self, max_age_secs: u64, now_secs: u64) -> bool {
        match now_secs.checked_sub(self.timestamp) {
            Some(age) => age <= max_age_secs,
            None => false,
        }
    }

    /// Check the fixed wire shape: current version, 32 lowercase hex nonce
    /// and a UUID v4 message ID. Returns the first violation found.
    pub fn check_wire_shape(&self) -> Result<(), &'static str> {
        if self.version != ENVELOPE_VERSION {
            return Err("unsupported envelope version");
        }
        if self.nonce.len() != NONCE_LEN * 2
            || !self
                .nonce
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err("nonce is not 32 lowercase hex chars");
        }
        match uuid::Uuid::parse_str(&self.message_id) {
            Ok(id) if id.get_version() == Some(uuid::Version::Random) => Ok(()),
            _ => Err("message id is not a UUID v4"),
        }
    }

    /// Sign the canonical bytes with an Ed25519 key.
    pub fn sign(self, key_pair: &KeyPair) -> SignedEnvelope {
        let signature = key_pair.signing_key().sign(&self.canonical_bytes());
        SignedEnvelope {
            envelope: self,
            signature: hex::encode(signature.to_bytes()),
            scheme: SignatureScheme::Ed25519,
        }
    }

    /// Sign the canonical bytes with HMAC-SHA256 over a shared secret.
    pub fn sign_hmac(self, secret: &[u8]) -> Result<SignedEnvelope, TpcError> {
        let mut mac = hmac_for(secret)
            .ok_or_else(|| TpcError::KeyFormat("HMAC secret must not be empty".into()))?;
        mac.update(&self.canonical_bytes());
        let tag = mac.finalize().into_bytes();
        Ok(SignedEnvelope {
            envelope: self,
            signature: hex::encode(tag),
            scheme: SignatureScheme::Hmac,
        })
    }
}

/// Fluent builder for envelopes.
///
/// ```ignore
/// let env = EnvelopeBuilder::new(payload, "agent-a", "agent-b")
///     .compression_version(2)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    payload: String,
    source_agent: String,
    target_agent: String,
    compression_version: Option<u32>,
    timestamp: Option<u64>,
}

impl EnvelopeBuilder {
    pub fn new(
        payload: impl Into<String>,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            compression_version: None,
            timestamp: None,
        }
    }

    pub fn compression_version(mut self, version: u32) -> Self {
        self.compression_version = Some(version);
        self
    }

    /// Override the creation time (Unix seconds). Defaults to now.
    pub fn timestamp(mut self, secs: u64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            version: ENVELOPE_VERSION,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: self.timestamp.unwrap_or_else(now_secs),
            nonce: generate_nonce(),
            source_agent: self.source_agent,
            target_agent: self.target_agent,
            compression_version: self.compression_version,
            payload: self.payload,
        }
    }
}

/// Fresh 128-bit nonce as 32 lowercase hex chars.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Ed25519,
    Hmac,
}

impl std::fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ed25519 => write!(f, "ed25519"),
            Self::Hmac => write!(f, "hmac"),
        }
    }
}

/// Key material a verifier holds, one variant per scheme.
#[derive(Debug, Clone, Copy)]
pub enum VerificationKey<'a> {
    Ed25519(&'a VerifyingKey),
    Hmac(&'a [u8]),
}

/// An envelope plus its hex signature.
///
/// Frames carrying fields outside the fixed wire shape are rejected at
/// decode time; they could never have been signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedEnvelope {
    pub envelope: Envelope,
    pub signature: String,
    pub scheme: SignatureScheme,
}

impl SignedEnvelope {
    /// Check the signature against `key`.
    ///
    /// Never errors: a scheme/key mismatch, undecodable signature or
    /// wrong key all yield `false`. HMAC tags are compared in constant time.
    pub fn verify(&self, key: VerificationKey<'_>) -> bool {
        let Ok(sig_bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let message = self.envelope.canonical_bytes();

        match (self.scheme, key) {
            (SignatureScheme::Ed25519, VerificationKey::Ed25519(verifying_key)) => {
                let Ok(signature) = Signature::from_slice(&sig_bytes) else {
                    return false;
                };
                verifying_key.verify_strict(&message, &signature).is_ok()
            }
            (SignatureScheme::Hmac, VerificationKey::Hmac(secret)) => match hmac_for(secret) {
                Some(mut mac) => {
                    mac.update(&message);
                    mac.verify_slice(&sig_bytes).is_ok()
                }
                None => false,
            },
            (SignatureScheme::Ed25519, VerificationKey::Hmac(_))
            | (SignatureScheme::Hmac, VerificationKey::Ed25519(_)) => false,
        }
    }

    /// Encode as a JSON frame for the transport driver.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpcError> {
        serde_json::to_vec(self).map_err(|e| TpcError::Serialization(e.to_string()))
    }

    /// Decode a JSON frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TpcError> {
        serde_json::from_slice(data).map_err(|e| TpcError::Deserialization(e.to_string()))
    }

    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }
}

fn hmac_for(secret: &[u8]) -> Option<HmacSha256> {
    if secret.is_empty() {
        return None;
    }
    HmacSha256::new_from_slice(secret).ok()
}

/// Current time in seconds since UNIX epoch.
pub fn now_secs() -> u64 {
    tpc_transport::now_ms() / 1000
}
