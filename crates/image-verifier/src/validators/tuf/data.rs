use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sigstore::crypto::{CosignVerificationKey, Signature, SigningScheme};

use super::errors::TrustDataError;

pub const ROOT_ROLE: &str = "root";
pub const TARGETS_ROLE: &str = "targets";
pub const SNAPSHOT_ROLE: &str = "snapshot";
pub const TIMESTAMP_ROLE: &str = "timestamp";

pub const BASE_ROLES: [&str; 4] = [ROOT_ROLE, TARGETS_ROLE, SNAPSHOT_ROLE, TIMESTAMP_ROLE];

pub const SHA256_HASH: &str = "sha256";

/// Raw signed role document: an opaque `signed` payload plus the
/// signatures over its canonical-JSON serialization.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedEnvelope {
    pub signed: serde_json::Value,
    #[serde(default)]
    pub signatures: Vec<RoleSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSignature {
    pub keyid: String,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleKey {
    pub keytype: String,
    pub keyval: KeyVal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyVal {
    pub public: String,
}

impl RoleKey {
    /// Builds a verification key out of the base64 encoded DER material.
    pub fn verification_key(&self, keyid: &str) -> Result<CosignVerificationKey, TrustDataError> {
        let der = general_purpose::STANDARD
            .decode(&self.keyval.public)
            .map_err(|e| TrustDataError::Key {
                name: keyid.to_string(),
                reason: e.to_string(),
            })?;

        let scheme = match self.keytype.as_str() {
            "ecdsa" | "ecdsa-x509" => SigningScheme::ECDSA_P256_SHA256_ASN1,
            "rsa" | "rsa-x509" => SigningScheme::RSA_PKCS1_SHA256(2048),
            "ed25519" => SigningScheme::ED25519,
            other => {
                return Err(TrustDataError::Key {
                    name: keyid.to_string(),
                    reason: format!("unsupported key type {other}"),
                })
            }
        };

        CosignVerificationKey::from_der(&der, &scheme).map_err(|e| TrustDataError::Key {
            name: keyid.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: usize,
}

/// Payload of the root role: the key database and the keys/thresholds
/// assigned to every base role.
#[derive(Debug, Clone, Deserialize)]
pub struct RootMeta {
    pub expires: DateTime<Utc>,
    pub keys: HashMap<String, RoleKey>,
    pub roles: HashMap<String, RoleKeys>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsMeta {
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub targets: HashMap<String, TargetFile>,
    #[serde(default)]
    pub delegations: Delegations,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetFile {
    pub hashes: HashMap<String, String>,
}

impl TargetFile {
    /// The sha256 hash as a `sha256:`-prefixed hex digest string.
    pub fn sha256_digest(&self) -> Option<String> {
        let encoded = self.hashes.get(SHA256_HASH)?;
        let raw = general_purpose::STANDARD.decode(encoded).ok()?;
        Some(format!("sha256:{}", hex::encode(raw)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delegations {
    #[serde(default)]
    pub keys: HashMap<String, RoleKey>,
    #[serde(default)]
    pub roles: Vec<DelegationRole>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationRole {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotMeta {
    pub expires: DateTime<Utc>,
    pub meta: HashMap<String, FileMeta>,
}

/// Timestamp carries the same shape as snapshot: an expiry plus hash
/// records for the roles it vouches for.
pub type TimestampMeta = SnapshotMeta;

#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub hashes: HashMap<String, String>,
}

impl FileMeta {
    pub fn matches(&self, payload: &[u8]) -> bool {
        use sha2::{Digest, Sha256};

        match self
            .hashes
            .get(SHA256_HASH)
            .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
        {
            Some(expected) => Sha256::digest(payload).as_slice() == expected.as_slice(),
            None => false,
        }
    }
}

/// Verifies one signature of a signed envelope against a key.
pub fn verify_role_signature(
    key: &CosignVerificationKey,
    signature: &RoleSignature,
    canonical_payload: &[u8],
) -> bool {
    key.verify_signature(
        Signature::Base64Encoded(signature.sig.as_bytes()),
        canonical_payload,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signed_envelope() {
        let raw = r#"{
            "signed": {"expires": "2035-01-01T00:00:00Z", "keys": {}, "roles": {}},
            "signatures": [{"keyid": "abc", "sig": "c2ln"}]
        }"#;
        let envelope: SignedEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.signatures.len(), 1);

        let root: RootMeta = serde_json::from_value(envelope.signed).unwrap();
        assert!(root.keys.is_empty());
    }

    #[test]
    fn target_file_digest_is_hex_encoded() {
        // base64 of 32 0xab bytes
        let target = TargetFile {
            hashes: HashMap::from([(
                SHA256_HASH.to_string(),
                general_purpose::STANDARD.encode([0xab; 32]),
            )]),
        };
        assert_eq!(
            target.sha256_digest().unwrap(),
            format!("sha256:{}", "ab".repeat(32))
        );
    }

    #[test]
    fn file_meta_checksum_match() {
        use sha2::{Digest, Sha256};

        let payload = b"role bytes";
        let meta = FileMeta {
            hashes: HashMap::from([(
                SHA256_HASH.to_string(),
                general_purpose::STANDARD.encode(Sha256::digest(payload)),
            )]),
        };
        assert!(meta.matches(payload));
        assert!(!meta.matches(b"tampered"));
    }

    #[test]
    fn unsupported_key_type_errors() {
        let key = RoleKey {
            keytype: "quantum".to_string(),
            keyval: KeyVal {
                public: general_purpose::STANDARD.encode(b"bytes"),
            },
        };
        assert!(key.verification_key("keyid").is_err());
    }
}
