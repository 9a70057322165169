mod verifiers;

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use pki_types::CertificateDer;
use serde::Deserialize;
use sigstore::cosign::{ClientBuilder, CosignCapabilities, SignatureLayer};
use sigstore::errors::SigstoreError;
use sigstore::registry::oci_reference::OciReference;
use sigstore::registry::{Certificate, CertificateEncoding, ClientConfig};
use sigstore::trust::sigstore::SigstoreTrustRoot;
use sigstore::trust::{ManualTrustRoot, TrustRoot as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::verifiers::Verifier;
use super::{ValidationError, ValidatorInitError};
use crate::auth::{select_trust_roots, Auth, TrustRoot};
use crate::image::Image;
use crate::policy::RuleOptions;

#[derive(Error, Debug)]
pub enum CosignError {
    #[error("error setting up cosign options: {0}")]
    Setup(String),
    #[error("error getting verifiers: {0}")]
    Verifiers(String),
    #[error("image {image} does not exist: {reason}")]
    ImageNotFound { image: String, reason: String },
    #[error("validation threshold not reached ({checked}/{threshold})")]
    ThresholdNotReached { checked: usize, threshold: usize },
    #[error("missing required signatures from [{0}]")]
    MissingRequired(String),
    #[error("ambiguous digests")]
    AmbiguousDigests,
    #[error("no signed digests")]
    NoSignedDigests,
    #[error("error validating image: {0}")]
    SoftFailures(String),
    #[error("context cancelled")]
    Cancelled,
}

/// Hosts of the transparency-log and certificate infrastructure. Unset
/// entries fall back to the public sigstore TUF repository.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CosignHost {
    #[serde(default)]
    pub rekor_pubkey: Option<String>,
    #[serde(default)]
    pub fulcio_cert: Option<String>,
    #[serde(default, rename = "ctLogPubkey")]
    pub ct_log_pubkey: Option<String>,
}

/// Verifies signatures stored next to the image manifest in the
/// registry, key-based or keyless, with threshold and required-signer
/// policies across the configured trust roots.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosignValidator {
    pub name: String,
    #[serde(default)]
    pub host: CosignHost,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub trust_roots: Vec<TrustRoot>,
}

enum VerifierOutcome {
    Ok {
        digests: Vec<String>,
        checked: usize,
        trust_root: String,
    },
    Soft {
        error: String,
    },
}

impl CosignValidator {
    pub fn initialize(&mut self, secrets_dir: &Path) -> Result<(), ValidatorInitError> {
        if self.trust_roots.is_empty() {
            return Err(ValidatorInitError::NoTrustRoots(self.name.clone()));
        }

        for pem_block in [
            self.cert.as_deref(),
            self.host.rekor_pubkey.as_deref(),
            self.host.fulcio_cert.as_deref(),
            self.host.ct_log_pubkey.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if pem::parse_many(pem_block.as_bytes())
                .map(|blocks| blocks.is_empty())
                .unwrap_or(true)
            {
                return Err(ValidatorInitError::InvalidCertificate(self.name.clone()));
            }
        }

        self.auth.load(secrets_dir)?;
        Ok(())
    }

    pub async fn validate(
        &self,
        token: &CancellationToken,
        image: &Image,
        opts: &RuleOptions,
    ) -> Result<String, ValidationError> {
        // collect the trust-root names taking part in this validation
        let trust_root_refs: Vec<String> = if opts.trust_root == "*"
            && (opts.threshold > opts.required.len() || opts.required.is_empty())
        {
            self.trust_roots.iter().map(|tr| tr.name.clone()).collect()
        } else if opts.trust_root == "*" && !opts.required.is_empty() {
            opts.required.clone()
        } else {
            vec![opts.trust_root.clone()]
        };

        let selected = select_trust_roots(&trust_root_refs, &self.trust_roots, true)
            .map_err(|e| CosignError::Verifiers(e.to_string()))?;
        let needs_keyless = selected.iter().any(|tr| tr.keyless.is_some());

        let verifiers = selected
            .iter()
            .map(|tr| Verifier::from_trust_root(tr))
            .collect::<Result<Vec<_>, _>>()?;

        let verify_tlog = opts.verify_in_transparency_log.unwrap_or(true);
        let verify_sct = opts.verify_sct.unwrap_or(true);

        // one signature fetch per image; the per-trust-root checks run on
        // the shared layers afterwards
        let layers = Arc::new(
            self.fetch_signature_layers(image, verify_tlog, verify_sct, needs_keyless)
                .await?,
        );

        let number_of_verifiers = verifiers.len();
        let (tx, mut rx) = mpsc::channel(number_of_verifiers);

        for verifier in verifiers {
            let layers = Arc::clone(&layers);
            let tx = tx.clone();
            let token = token.clone();
            let image_name = image.name();
            tokio::spawn(async move {
                debug!(
                    image = image_name.as_str(),
                    trust_root = verifier.name.as_str(),
                    "validating image with trust root"
                );

                let matching: Vec<&SignatureLayer> = layers
                    .iter()
                    .filter(|layer| verifier.matches(layer))
                    .collect();

                let outcome = if matching.is_empty() {
                    VerifierOutcome::Soft {
                        error: format!("no valid signatures for trust root {}", verifier.name),
                    }
                } else {
                    VerifierOutcome::Ok {
                        digests: matching
                            .iter()
                            .map(|layer| {
                                layer
                                    .simple_signing
                                    .critical
                                    .image
                                    .docker_manifest_digest
                                    .clone()
                            })
                            .collect(),
                        checked: matching.len(),
                        trust_root: verifier.name.clone(),
                    }
                };

                if token.is_cancelled() {
                    return;
                }
                let _ = tx.try_send(outcome);
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(number_of_verifiers);
        for _ in 0..number_of_verifiers {
            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(CosignError::Cancelled.into()),
                outcome = rx.recv() => outcome.ok_or(CosignError::Cancelled)?,
            };
            outcomes.push(outcome);
        }

        Ok(evaluate_aggregate(opts, number_of_verifiers, outcomes)?)
    }

    /// Fetches and pre-verifies the signature layers attached to the
    /// image manifest. Transparency-log and SCT verification happen here
    /// through the trust material handed to the cosign client.
    async fn fetch_signature_layers(
        &self,
        image: &Image,
        verify_tlog: bool,
        verify_sct: bool,
        needs_keyless: bool,
    ) -> Result<Vec<SignatureLayer>, CosignError> {
        let mut client_config = ClientConfig::default();
        if let Some(cert) = &self.cert {
            client_config.extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data: cert.as_bytes().to_vec(),
            });
        }

        // the trust root has to outlive the client built from it
        let trust_root = self
            .trust_material(verify_tlog, verify_sct, needs_keyless)
            .await?;

        let mut builder = ClientBuilder::default()
            .with_oci_client_config(client_config)
            .enable_registry_caching();

        match &trust_root {
            Some(trust_root) => {
                builder = builder
                    .with_trust_repository(trust_root)
                    .map_err(|e| CosignError::Setup(e.to_string()))?;
            }
            None => {
                warn!("cosign client built without trust material, keyless signatures and transparency log data cannot be verified");
            }
        }

        let mut client = builder
            .build()
            .map_err(|e| CosignError::Setup(e.to_string()))?;

        let auth_entry = self.auth.look_up(&image.context());
        let sigstore_auth = if auth_entry.username.is_empty() {
            sigstore::registry::Auth::Anonymous
        } else {
            sigstore::registry::Auth::Basic(auth_entry.username, auth_entry.password)
        };

        let image_ref = OciReference::from_str(&image.name())
            .map_err(|e| CosignError::Setup(e.to_string()))?;

        let (cosign_signature_image, source_image_digest) = client
            .triangulate(&image_ref, &sigstore_auth)
            .await
            .map_err(|e| CosignError::ImageNotFound {
                image: image.name(),
                reason: e.to_string(),
            })?;

        match client
            .trusted_signature_layers(&sigstore_auth, &source_image_digest, &cosign_signature_image)
            .await
        {
            Ok(layers) => Ok(layers),
            Err(SigstoreError::RegistryPullManifestError { .. }) => {
                // the image exists but carries no signature artifact;
                // every verifier will report a soft failure
                info!(image = image.name().as_str(), "no signatures found");
                Ok(Vec::new())
            }
            Err(e) => Err(CosignError::Setup(e.to_string())),
        }
    }
}

/// Applies the threshold / required / single-digest policy to the
/// per-trust-root outcomes: the number of checked signatures must reach
/// the threshold, every required trust root must be among the
/// validating ones, and the signed digests must agree on one value.
fn evaluate_aggregate(
    opts: &RuleOptions,
    number_of_verifiers: usize,
    outcomes: Vec<VerifierOutcome>,
) -> Result<String, CosignError> {
    let mut checked_signatures = 0;
    let mut validating_trust_roots: Vec<String> = Vec::new();
    let mut digests: BTreeSet<String> = BTreeSet::new();
    let mut soft_errors: Vec<String> = Vec::new();

    for outcome in outcomes {
        match outcome {
            VerifierOutcome::Ok {
                digests: signed_digests,
                checked,
                trust_root,
            } => {
                checked_signatures += checked;
                validating_trust_roots.push(trust_root);
                digests.extend(signed_digests);
            }
            VerifierOutcome::Soft { error } => soft_errors.push(error),
        }
    }

    let threshold = if opts.trust_root == "*" {
        if opts.threshold > 0 {
            opts.threshold
        } else if !opts.required.is_empty() {
            opts.required.len()
        } else {
            number_of_verifiers
        }
    } else {
        0
    };

    if threshold > 0 && checked_signatures < threshold {
        return Err(CosignError::ThresholdNotReached {
            checked: checked_signatures,
            threshold,
        });
    }

    if !opts.required.is_empty() {
        debug!(required = ?opts.required, "required signatures");
        let missing: Vec<String> = opts
            .required
            .iter()
            .filter(|name| !validating_trust_roots.contains(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CosignError::MissingRequired(missing.join(", ")));
        }
    }

    debug!(
        signatures = checked_signatures,
        trust_roots = ?validating_trust_roots,
        "validated signatures"
    );

    if digests.len() > 1 {
        return Err(CosignError::AmbiguousDigests);
    }
    if let Some(digest) = digests.into_iter().next() {
        if !soft_errors.is_empty() {
            debug!(errors = ?soft_errors, "soft verifier errors after successful validation");
        }
        return Ok(digest);
    }

    if !soft_errors.is_empty() {
        return Err(CosignError::SoftFailures(soft_errors.join("; ")));
    }

    Err(CosignError::NoSignedDigests)
}

impl CosignValidator {
    /// Builds the trust root handed to the cosign client, mixing pinned
    /// key material with the public sigstore TUF repository for
    /// everything not pinned. Returns nothing when neither transparency
    /// log, SCT nor keyless verification is asked for.
    async fn trust_material(
        &self,
        verify_tlog: bool,
        verify_sct: bool,
        needs_keyless: bool,
    ) -> Result<Option<ManualTrustRoot<'static>>, CosignError> {
        if !(verify_tlog || verify_sct || needs_keyless) {
            return Ok(None);
        }

        let defaults_needed = (verify_tlog && self.host.rekor_pubkey.is_none())
            || (verify_sct && self.host.ct_log_pubkey.is_none())
            || ((verify_sct || needs_keyless) && self.host.fulcio_cert.is_none());
        let defaults = if defaults_needed {
            Some(default_trust_material().await?)
        } else {
            None
        };
        let default_keys = |keys: fn(&DefaultTrustMaterial) -> &Vec<Vec<u8>>| {
            defaults.as_ref().map(|d| keys(d).clone()).unwrap_or_default()
        };

        let mut trust_root = ManualTrustRoot::default();

        if verify_tlog {
            trust_root.rekor_keys = match &self.host.rekor_pubkey {
                Some(pinned) => vec![pem_contents(pinned)?],
                None => default_keys(|d| &d.rekor_keys),
            };
        }

        if verify_sct {
            trust_root.ctfe_keys = match &self.host.ct_log_pubkey {
                Some(pinned) => vec![pem_contents(pinned)?],
                None => default_keys(|d| &d.ctfe_keys),
            };
        }

        if verify_sct || needs_keyless {
            trust_root.fulcio_certs = match &self.host.fulcio_cert {
                Some(pinned) => pem::parse_many(pinned.as_bytes())
                    .map_err(|e| CosignError::Setup(format!("invalid fulcio certificate: {e}")))?
                    .into_iter()
                    .map(|block| CertificateDer::from(block.into_contents()))
                    .collect(),
                None => default_keys(|d| &d.fulcio_certs)
                    .into_iter()
                    .map(CertificateDer::from)
                    .collect(),
            };
        }

        Ok(Some(trust_root))
    }
}

fn pem_contents(pem_data: &str) -> Result<Vec<u8>, CosignError> {
    pem::parse(pem_data.as_bytes())
        .map(|block| block.into_contents())
        .map_err(|e| CosignError::Setup(format!("invalid PEM material: {e}")))
}

/// Trust material of the public sigstore infrastructure, fetched once
/// per process from its TUF repository.
struct DefaultTrustMaterial {
    fulcio_certs: Vec<Vec<u8>>,
    rekor_keys: Vec<Vec<u8>>,
    ctfe_keys: Vec<Vec<u8>>,
}

static DEFAULT_TRUST_MATERIAL: tokio::sync::OnceCell<Arc<DefaultTrustMaterial>> =
    tokio::sync::OnceCell::const_new();

async fn default_trust_material() -> Result<Arc<DefaultTrustMaterial>, CosignError> {
    let fetch_error =
        |e: SigstoreError| CosignError::Setup(format!("cannot fetch sigstore trust root: {e}"));

    DEFAULT_TRUST_MATERIAL
        .get_or_try_init(|| async {
            let repository = SigstoreTrustRoot::new(None).await.map_err(fetch_error)?;

            let fulcio_certs = repository
                .fulcio_certs()
                .map_err(fetch_error)?
                .into_iter()
                .map(|cert| cert.as_ref().to_vec())
                .collect();
            let rekor_keys = repository
                .rekor_keys()
                .map_err(fetch_error)?
                .into_iter()
                .map(|key| key.to_vec())
                .collect();
            let ctfe_keys = repository
                .ctfe_keys()
                .map_err(fetch_error)?
                .into_iter()
                .map(|key| key.to_vec())
                .collect();

            Ok(Arc::new(DefaultTrustMaterial {
                fulcio_certs,
                rekor_keys,
                ctfe_keys,
            }))
        })
        .await
        .cloned()
}
