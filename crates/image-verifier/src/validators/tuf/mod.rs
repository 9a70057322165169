mod client;
pub mod data;
pub mod errors;
mod repo;

pub use client::NotaryClient;
pub use repo::TrustRepo;

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use sigstore::crypto::CosignVerificationKey;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::data::{TargetsMeta, TARGETS_ROLE};
use self::errors::TrustDataError;
use super::{ValidationError, ValidatorInitError};
use crate::auth::{select_trust_roots, Auth, TrustRoot};
use crate::image::Image;
use crate::policy::RuleOptions;

const DEFAULT_NOTARY_HOST: &str = "notary.docker.io";

/// Validator against hierarchical trust metadata served by a notary
/// server. Downloads the base roles (plus delegations when required),
/// verifies the signature and checksum chain, and resolves the image's
/// digest from the signed targets.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotaryValidator {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub trust_roots: Vec<TrustRoot>,
}

impl NotaryValidator {
    pub fn initialize(&mut self, secrets_dir: &Path) -> Result<(), ValidatorInitError> {
        if self.trust_roots.is_empty() {
            return Err(ValidatorInitError::NoTrustRoots(self.name.clone()));
        }

        if self.host.is_empty() {
            self.host = format!("https://{DEFAULT_NOTARY_HOST}");
        } else if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            // default to https for notary servers when no protocol is given
            self.host = format!("https://{}", self.host);
        }
        url::Url::parse(&self.host)
            .map_err(|e| ValidatorInitError::InvalidHost(e.to_string()))?;

        if let Some(cert) = &self.cert {
            let blocks = pem::parse_many(cert.as_bytes())
                .map_err(|_| ValidatorInitError::InvalidCertificate(self.name.clone()))?;
            if blocks.is_empty() {
                return Err(ValidatorInitError::InvalidCertificate(self.name.clone()));
            }
        }

        self.auth.load(secrets_dir)?;
        // a secret without a registry key belongs to the validator's host
        self.auth
            .rewrite_empty_registry(&self.host)
            .map_err(ValidatorInitError::Auth)?;

        Ok(())
    }

    pub async fn validate(
        &self,
        token: &CancellationToken,
        image: &Image,
        opts: &RuleOptions,
    ) -> Result<String, ValidationError> {
        let client =
            NotaryClient::new(&self.host, self.cert.as_deref(), &self.auth, image).await?;

        let mut trust_repo = TrustRepo::default();
        trust_repo.download_base(token, &client).await?;
        debug!("successfully downloaded trust data");

        let root_keys = self.trust_root_keys(&opts.trust_root)?;
        trust_repo.verify_base_trust_data(&root_keys)?;

        // gather the target roles to search, downloading and verifying
        // delegations when they are required or present
        let mut targets: Vec<String> = Vec::new();
        if opts.delegations.is_empty() && !trust_repo.has_delegations() {
            targets.push(TARGETS_ROLE.to_string());
        } else {
            if !trust_repo.has_delegations() {
                return Err(TrustDataError::NoDelegations(opts.delegations.clone()).into());
            }

            if opts.delegations.is_empty() {
                targets.push(to_delegation_name("releases"));
            } else {
                targets.extend(opts.delegations.iter().map(|d| to_delegation_name(d)));
            }

            if let Err(e) = trust_repo
                .download_and_validate_delegations(token, &client, &targets)
                .await
            {
                // delegations can be declared in targets without the files
                // ever being published (signers added, nothing signed);
                // then the canonical targets role is authoritative
                if matches!(e, TrustDataError::Status { .. })
                    && !trust_repo.has_delegation_hashes(&targets)
                {
                    targets = vec![TARGETS_ROLE.to_string()];
                } else {
                    return Err(TrustDataError::DelegationDownload(targets).into());
                }
            }
        }

        Ok(resolve_digest(&trust_repo, &targets, image)?)
    }

    /// Parses the PEM keys of the selected trust roots. The
    /// all-quantifier selects every key of the validator.
    fn trust_root_keys(
        &self,
        key_ref: &str,
    ) -> Result<Vec<(String, CosignVerificationKey)>, ValidationError> {
        let trust_roots =
            select_trust_roots(&[key_ref.to_string()], &self.trust_roots, true)?;

        let mut keys = Vec::with_capacity(trust_roots.len());
        for trust_root in trust_roots {
            let pem_key = trust_root.key.as_deref().ok_or_else(|| {
                TrustDataError::Key {
                    name: trust_root.name.clone(),
                    reason: "trust root carries no public key".to_string(),
                }
            })?;
            let key = CosignVerificationKey::try_from_pem(pem_key.as_bytes()).map_err(|e| {
                TrustDataError::Key {
                    name: trust_root.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            keys.push((trust_root.name.clone(), key));
        }

        Ok(keys)
    }
}

/// Resolves the image's digest against the signed targets of the given
/// roles. A tagged image looks its tag up in every role (and an
/// additionally given digest has to match); a digest-only image scans
/// every entry. The roles must agree on one digest.
fn resolve_digest(
    trust_repo: &TrustRepo,
    targets: &[String],
    image: &Image,
) -> Result<String, TrustDataError> {
    debug!(targets = ?targets, image = image.original_string(), "searching targets for digest");

    let mut digests: BTreeSet<String> = BTreeSet::new();
    for target in targets {
        let signed_targets = trust_repo
            .targets
            .get(target)
            .ok_or_else(|| TrustDataError::DelegationNotFound(target.clone()))?;

        let digest = if !image.tag().is_empty() {
            let digest = search_targets_for_tag(signed_targets, image.tag())?;
            // an input carrying tag and digest: the digest resolved for
            // the tag must match the given one
            if !image.digest().is_empty() && image.digest() != digest {
                return Err(TrustDataError::DigestMismatch {
                    digest,
                    tag: image.tag().to_string(),
                    given: image.digest().to_string(),
                });
            }
            digest
        } else {
            search_targets_for_digest(signed_targets, image.digest())?
        };

        debug!(digest = digest.as_str(), "found digest");
        digests.insert(digest);
    }

    if digests.len() != 1 {
        return Err(TrustDataError::AmbiguousDigest {
            count: digests.len(),
            image: image.name(),
        });
    }

    Ok(digests.into_iter().next().unwrap_or_default())
}

fn to_delegation_name(delegation: &str) -> String {
    if delegation.starts_with("targets/") {
        delegation.to_string()
    } else {
        format!("targets/{delegation}")
    }
}

fn search_targets_for_tag(targets: &TargetsMeta, tag: &str) -> Result<String, TrustDataError> {
    debug!(tag = tag, "searching targets for tag");

    targets
        .targets
        .get(tag)
        .and_then(|target| target.sha256_digest())
        .ok_or_else(|| TrustDataError::ReferenceNotFound(format!("no tag '{tag}' found in targets")))
}

fn search_targets_for_digest(
    targets: &TargetsMeta,
    digest: &str,
) -> Result<String, TrustDataError> {
    debug!(digest = digest, "searching targets for digest");

    targets
        .targets
        .values()
        .filter_map(|target| target.sha256_digest())
        .find(|candidate| candidate == digest)
        .ok_or_else(|| {
            TrustDataError::ReferenceNotFound(format!("no digest '{digest}' found in targets"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::{engine::general_purpose, Engine as _};
    use serde_json::json;

    fn validator(host: &str) -> NotaryValidator {
        NotaryValidator {
            name: "notary".to_string(),
            host: host.to_string(),
            cert: None,
            auth: Auth::default(),
            trust_roots: vec![TrustRoot {
                name: "default".to_string(),
                key: Some("key".to_string()),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn initialize_defaults_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = validator("");
        v.initialize(dir.path()).unwrap();
        assert_eq!(v.host, "https://notary.docker.io");
    }

    #[test]
    fn initialize_prefixes_https() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = validator("notary.example.com");
        v.initialize(dir.path()).unwrap();
        assert_eq!(v.host, "https://notary.example.com");

        let mut v = validator("http://plain.example.com");
        v.initialize(dir.path()).unwrap();
        assert_eq!(v.host, "http://plain.example.com");
    }

    #[test]
    fn initialize_requires_trust_roots() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = validator("");
        v.trust_roots.clear();
        assert!(matches!(
            v.initialize(dir.path()),
            Err(ValidatorInitError::NoTrustRoots(_))
        ));
    }

    #[test]
    fn initialize_rejects_bogus_cert() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = validator("");
        v.cert = Some("not a pem block".to_string());
        assert!(matches!(
            v.initialize(dir.path()),
            Err(ValidatorInitError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn delegation_names_are_normalized() {
        assert_eq!(to_delegation_name("releases"), "targets/releases");
        assert_eq!(to_delegation_name("targets/qa"), "targets/qa");
    }

    fn targets_with(tag: &str, hash: [u8; 32]) -> TargetsMeta {
        serde_json::from_value(json!({
            "expires": "2099-01-01T00:00:00Z",
            "targets": {
                tag: {"hashes": {"sha256": general_purpose::STANDARD.encode(hash)}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn searches_targets_by_tag() {
        let targets = targets_with("v1", [0xcd; 32]);
        let digest = search_targets_for_tag(&targets, "v1").unwrap();
        assert_eq!(digest, format!("sha256:{}", "cd".repeat(32)));

        let err = search_targets_for_tag(&targets, "v2").unwrap_err();
        assert!(err.to_string().contains("no tag 'v2' found"));
    }

    #[test]
    fn searches_targets_by_digest() {
        let targets = targets_with("v1", [0xcd; 32]);
        let wanted = format!("sha256:{}", "cd".repeat(32));
        assert_eq!(
            search_targets_for_digest(&targets, &wanted).unwrap(),
            wanted
        );
        assert!(search_targets_for_digest(&targets, "sha256:ffff").is_err());
    }

    fn repo_with_targets(roles: &[(&str, TargetsMeta)]) -> TrustRepo {
        let mut repo = TrustRepo::default();
        for (name, targets) in roles {
            repo.targets.insert(name.to_string(), targets.clone());
        }
        repo
    }

    #[test]
    fn resolves_digest_from_single_role() {
        let repo = repo_with_targets(&[(TARGETS_ROLE, targets_with("v1", [0xcd; 32]))]);
        let image = Image::new("org/image:v1").unwrap();
        let digest =
            resolve_digest(&repo, &[TARGETS_ROLE.to_string()], &image).unwrap();
        assert_eq!(digest, format!("sha256:{}", "cd".repeat(32)));
    }

    #[test]
    fn conflicting_delegations_are_ambiguous() {
        let repo = repo_with_targets(&[
            ("targets/releases", targets_with("v1", [0xcd; 32])),
            ("targets/qa", targets_with("v1", [0xab; 32])),
        ]);
        let image = Image::new("org/image:v1").unwrap();
        let err = resolve_digest(
            &repo,
            &["targets/releases".to_string(), "targets/qa".to_string()],
            &image,
        )
        .unwrap_err();
        assert!(matches!(err, TrustDataError::AmbiguousDigest { count: 2, .. }));
    }

    #[test]
    fn given_digest_must_match_resolved_tag() {
        let repo = repo_with_targets(&[(TARGETS_ROLE, targets_with("v1", [0xcd; 32]))]);
        let image = Image::new(&format!(
            "org/image:v1@sha256:{}",
            "ab".repeat(32)
        ))
        .unwrap();
        let err = resolve_digest(&repo, &[TARGETS_ROLE.to_string()], &image).unwrap_err();
        assert!(matches!(err, TrustDataError::DigestMismatch { .. }));

        let image = Image::new(&format!(
            "org/image:v1@sha256:{}",
            "cd".repeat(32)
        ))
        .unwrap();
        let digest = resolve_digest(&repo, &[TARGETS_ROLE.to_string()], &image).unwrap();
        assert_eq!(digest, format!("sha256:{}", "cd".repeat(32)));
    }
}
