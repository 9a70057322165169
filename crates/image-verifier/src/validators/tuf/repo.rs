use std::collections::HashMap;

use canon_json::CanonJsonSerialize;
use chrono::Utc;
use sigstore::crypto::CosignVerificationKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::NotaryClient;
use super::data::{
    verify_role_signature, RootMeta, SignedEnvelope, SnapshotMeta, TargetsMeta, TimestampMeta,
    BASE_ROLES, ROOT_ROLE, SNAPSHOT_ROLE, TARGETS_ROLE, TIMESTAMP_ROLE,
};
use super::errors::TrustDataError;

/// The downloaded trust metadata of one repository, together with the
/// raw bytes needed for checksum and signature verification.
#[derive(Default)]
pub struct TrustRepo {
    root: Option<RootMeta>,
    pub targets: HashMap<String, TargetsMeta>,
    snapshot: Option<SnapshotMeta>,
    timestamp: Option<TimestampMeta>,
    envelopes: HashMap<String, SignedEnvelope>,
    raw: HashMap<String, Vec<u8>>,
}

impl TrustRepo {
    /// Downloads the four base roles concurrently.
    pub async fn download_base(
        &mut self,
        token: &CancellationToken,
        client: &NotaryClient,
    ) -> Result<(), TrustDataError> {
        let (tx, mut rx) = mpsc::channel(BASE_ROLES.len());

        for role in BASE_ROLES {
            let client = client.clone();
            let tx = tx.clone();
            let token = token.clone();
            tokio::spawn(async move {
                client.fetch_trust_data(&token, role, tx).await;
            });
        }
        drop(tx);

        for _ in BASE_ROLES {
            let trust_data = tokio::select! {
                _ = token.cancelled() => return Err(TrustDataError::Cancelled),
                data = rx.recv() => data.ok_or(TrustDataError::Cancelled)?,
            };

            if let Some(error) = trust_data.error {
                return Err(error);
            }
            debug!(role = trust_data.role.as_str(), "got trust data");

            self.store_role(&trust_data.role, trust_data.envelope, trust_data.raw)?;
        }

        Ok(())
    }

    fn store_role(
        &mut self,
        role: &str,
        envelope: Option<SignedEnvelope>,
        raw: Vec<u8>,
    ) -> Result<(), TrustDataError> {
        let envelope = envelope.ok_or_else(|| TrustDataError::Parse {
            role: role.to_string(),
            reason: "missing signed envelope".to_string(),
        })?;

        let parse_error = |e: serde_json::Error| TrustDataError::Parse {
            role: role.to_string(),
            reason: e.to_string(),
        };

        match role {
            ROOT_ROLE => {
                self.root = Some(serde_json::from_value(envelope.signed.clone()).map_err(parse_error)?)
            }
            SNAPSHOT_ROLE => {
                self.snapshot =
                    Some(serde_json::from_value(envelope.signed.clone()).map_err(parse_error)?)
            }
            TIMESTAMP_ROLE => {
                self.timestamp =
                    Some(serde_json::from_value(envelope.signed.clone()).map_err(parse_error)?)
            }
            // targets and delegation roles share the same payload shape
            _ => {
                let targets: TargetsMeta =
                    serde_json::from_value(envelope.signed.clone()).map_err(parse_error)?;
                self.targets.insert(role.to_string(), targets);
            }
        }

        self.envelopes.insert(role.to_string(), envelope);
        self.raw.insert(role.to_string(), raw);
        Ok(())
    }

    fn root(&self) -> Result<&RootMeta, TrustDataError> {
        self.root.as_ref().ok_or_else(|| TrustDataError::Parse {
            role: ROOT_ROLE.to_string(),
            reason: "root not downloaded".to_string(),
        })
    }

    fn snapshot(&self) -> Result<&SnapshotMeta, TrustDataError> {
        self.snapshot.as_ref().ok_or_else(|| TrustDataError::Parse {
            role: SNAPSHOT_ROLE.to_string(),
            reason: "snapshot not downloaded".to_string(),
        })
    }

    fn timestamp(&self) -> Result<&TimestampMeta, TrustDataError> {
        self.timestamp
            .as_ref()
            .ok_or_else(|| TrustDataError::Parse {
                role: TIMESTAMP_ROLE.to_string(),
                reason: "timestamp not downloaded".to_string(),
            })
    }

    fn canonical_payload(&self, role: &str) -> Result<Vec<u8>, TrustDataError> {
        let envelope = self.envelopes.get(role).ok_or_else(|| TrustDataError::Parse {
            role: role.to_string(),
            reason: "role not downloaded".to_string(),
        })?;
        envelope
            .signed
            .to_canon_json_vec()
            .map_err(|e| TrustDataError::Canonical {
                role: role.to_string(),
                reason: e.to_string(),
            })
    }

    /// Verifies root signatures with the configured trust-root keys,
    /// then the remaining base roles against root's key database, then
    /// the checksum chain. Every step has to pass.
    pub fn verify_base_trust_data(
        &self,
        trust_root_keys: &[(String, CosignVerificationKey)],
    ) -> Result<(), TrustDataError> {
        self.verify_root(trust_root_keys)?;
        self.verify_base_roles()?;
        self.verify_base_checksums()
    }

    fn verify_root(
        &self,
        trust_root_keys: &[(String, CosignVerificationKey)],
    ) -> Result<(), TrustDataError> {
        let payload = self.canonical_payload(ROOT_ROLE)?;
        let envelope = &self.envelopes[ROOT_ROLE];

        if envelope.signatures.is_empty() {
            return Err(TrustDataError::NoRootSignatures);
        }

        // every configured trust-root key needs at least one valid root
        // signature
        for (name, key) in trust_root_keys {
            let verified = envelope
                .signatures
                .iter()
                .any(|signature| verify_role_signature(key, signature, &payload));
            if !verified {
                return Err(TrustDataError::RootSignature(name.clone()));
            }
            debug!(key = name.as_str(), "root signature verified");
        }

        if self.root()?.expires <= Utc::now() {
            return Err(TrustDataError::Expired(ROOT_ROLE.to_string()));
        }

        Ok(())
    }

    fn verify_base_roles(&self) -> Result<(), TrustDataError> {
        let root = self.root()?;

        for role in [TARGETS_ROLE, SNAPSHOT_ROLE, TIMESTAMP_ROLE] {
            let role_keys = root
                .roles
                .get(role)
                .ok_or_else(|| TrustDataError::RoleSignatures(role.to_string()))?;
            let payload = self.canonical_payload(role)?;
            let envelope = &self.envelopes[role];

            let mut valid = 0;
            for keyid in &role_keys.keyids {
                let Some(role_key) = root.keys.get(keyid) else {
                    continue;
                };
                let Ok(key) = role_key.verification_key(keyid) else {
                    continue;
                };
                let key_signed = envelope
                    .signatures
                    .iter()
                    .filter(|signature| &signature.keyid == keyid)
                    .any(|signature| verify_role_signature(&key, signature, &payload));
                if key_signed {
                    valid += 1;
                }
            }

            if valid < role_keys.threshold.max(1) {
                return Err(TrustDataError::RoleSignatures(role.to_string()));
            }

            let expires = match role {
                TARGETS_ROLE => {
                    self.targets
                        .get(TARGETS_ROLE)
                        .ok_or_else(|| TrustDataError::RoleSignatures(role.to_string()))?
                        .expires
                }
                SNAPSHOT_ROLE => self.snapshot()?.expires,
                _ => self.timestamp()?.expires,
            };
            if expires <= Utc::now() {
                return Err(TrustDataError::Expired(role.to_string()));
            }

            debug!(role = role, "successful validation");
        }

        Ok(())
    }

    fn verify_base_checksums(&self) -> Result<(), TrustDataError> {
        // targets and root hashes are recorded in snapshot, snapshot's in
        // timestamp; timestamp itself is the trust anchor of the chain
        for (role, recorded_in) in [
            (ROOT_ROLE, self.snapshot()?),
            (TARGETS_ROLE, self.snapshot()?),
            (SNAPSHOT_ROLE, self.timestamp()?),
        ] {
            let payload = self
                .raw
                .get(role)
                .ok_or_else(|| TrustDataError::MissingChecksums(role.to_string()))?;
            let meta = recorded_in
                .meta
                .get(role)
                .ok_or_else(|| TrustDataError::MissingChecksums(role.to_string()))?;
            if !meta.matches(payload) {
                return Err(TrustDataError::ChecksumMismatch(role.to_string()));
            }
        }

        Ok(())
    }

    pub fn has_delegations(&self) -> bool {
        self.targets
            .get(TARGETS_ROLE)
            .map(|targets| !targets.delegations.roles.is_empty())
            .unwrap_or(false)
    }

    /// Whether the snapshot role records hashes for all given
    /// delegations. Absent hashes mean the delegation files were never
    /// published.
    pub fn has_delegation_hashes(&self, delegations: &[String]) -> bool {
        match &self.snapshot {
            Some(snapshot) => delegations
                .iter()
                .all(|delegation| snapshot.meta.contains_key(delegation)),
            None => false,
        }
    }

    /// Downloads the given delegation roles and verifies them with the
    /// delegation keys declared by targets.
    pub async fn download_and_validate_delegations(
        &mut self,
        token: &CancellationToken,
        client: &NotaryClient,
        delegations: &[String],
    ) -> Result<(), TrustDataError> {
        let available: Vec<String> = self
            .targets
            .get(TARGETS_ROLE)
            .map(|targets| {
                targets
                    .delegations
                    .roles
                    .iter()
                    .map(|role| role.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        debug!(roles = ?available, "available delegation roles");

        for delegation in delegations {
            if !available.contains(delegation) {
                return Err(TrustDataError::DelegationNotFound(delegation.clone()));
            }
        }

        let (tx, mut rx) = mpsc::channel(delegations.len());
        for delegation in delegations {
            let client = client.clone();
            let tx = tx.clone();
            let token = token.clone();
            let delegation = delegation.clone();
            tokio::spawn(async move {
                client.fetch_trust_data(&token, &delegation, tx).await;
            });
        }
        drop(tx);

        for _ in delegations {
            let trust_data = tokio::select! {
                _ = token.cancelled() => return Err(TrustDataError::Cancelled),
                data = rx.recv() => data.ok_or(TrustDataError::Cancelled)?,
            };
            if let Some(error) = trust_data.error {
                return Err(error);
            }
            self.store_role(&trust_data.role, trust_data.envelope, trust_data.raw)?;
        }

        debug!(delegations = ?delegations, "validating delegations");
        self.validate_delegations(delegations)
    }

    fn validate_delegations(&self, delegations: &[String]) -> Result<(), TrustDataError> {
        let targets = self
            .targets
            .get(TARGETS_ROLE)
            .ok_or_else(|| TrustDataError::RoleSignatures(TARGETS_ROLE.to_string()))?;

        for delegation in delegations {
            let role = targets
                .delegations
                .roles
                .iter()
                .find(|role| &role.name == delegation)
                .ok_or_else(|| TrustDataError::DelegationNotFound(delegation.clone()))?;

            let payload = self.canonical_payload(delegation)?;
            let envelope = self
                .envelopes
                .get(delegation)
                .ok_or_else(|| TrustDataError::DelegationNotFound(delegation.clone()))?;

            let mut valid = 0;
            for keyid in &role.keyids {
                let Some(role_key) = targets.delegations.keys.get(keyid) else {
                    continue;
                };
                let Ok(key) = role_key.verification_key(keyid) else {
                    continue;
                };
                let key_signed = envelope
                    .signatures
                    .iter()
                    .filter(|signature| &signature.keyid == keyid)
                    .any(|signature| verify_role_signature(&key, signature, &payload));
                if key_signed {
                    valid += 1;
                }
            }
            if valid < role.threshold.max(1) {
                return Err(TrustDataError::RoleSignatures(delegation.clone()));
            }

            let delegation_targets = self
                .targets
                .get(delegation)
                .ok_or_else(|| TrustDataError::DelegationNotFound(delegation.clone()))?;
            if delegation_targets.expires <= Utc::now() {
                return Err(TrustDataError::Expired(delegation.clone()));
            }

            let payload_raw = self
                .raw
                .get(delegation)
                .ok_or_else(|| TrustDataError::MissingChecksums(delegation.clone()))?;
            let meta = self
                .snapshot()?
                .meta
                .get(delegation)
                .ok_or_else(|| TrustDataError::MissingChecksums(delegation.clone()))?;
            if !meta.matches(payload_raw) {
                return Err(TrustDataError::ChecksumMismatch(delegation.clone()));
            }
        }

        Ok(())
    }
}
