pub mod cosign;
pub mod static_validator;
pub mod truststore;
pub mod tuf;

pub use static_validator::StaticValidator;

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, TrustRootError};
use crate::image::Image;
use crate::policy::RuleOptions;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("static deny")]
    StaticDeny,
    #[error(transparent)]
    TrustRoot(#[from] TrustRootError),
    #[error(transparent)]
    TrustData(#[from] tuf::errors::TrustDataError),
    #[error(transparent)]
    Cosign(#[from] cosign::CosignError),
    #[error(transparent)]
    TrustStore(#[from] truststore::TrustStoreError),
}

#[derive(Error, Debug)]
pub enum ValidatorInitError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid url for notary host: {0}")]
    InvalidHost(String),
    #[error("invalid certificate for validator {0}")]
    InvalidCertificate(String),
    #[error("no trust roots provided for validator {0}")]
    NoTrustRoots(String),
    #[error("no certificate provided for trust root {0}")]
    MissingTrustRootCertificate(String),
    #[error("invalid trust root {name}: {reason}")]
    InvalidTrustRoot { name: String, reason: String },
}

/// The configured signature-verification backends, selected per rule.
/// Each variant owns its trust roots, credentials and host endpoints;
/// the only shared contract is `validate`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Validator {
    #[serde(rename = "static")]
    Static(StaticValidator),
    #[serde(rename = "notaryv1")]
    Notary(tuf::NotaryValidator),
    #[serde(rename = "cosign")]
    Cosign(cosign::CosignValidator),
    #[serde(rename = "notation")]
    Notation(truststore::TrustStoreValidator),
}

impl Validator {
    pub fn name(&self) -> &str {
        match self {
            Validator::Static(v) => &v.name,
            Validator::Notary(v) => &v.name,
            Validator::Cosign(v) => &v.name,
            Validator::Notation(v) => &v.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Validator::Static(_) => "static",
            Validator::Notary(_) => "notaryv1",
            Validator::Cosign(_) => "cosign",
            Validator::Notation(_) => "notation",
        }
    }

    /// Static validators are fast enough to bypass the cache and the
    /// skip machinery entirely.
    pub fn is_static(&self) -> bool {
        matches!(self, Validator::Static(_))
    }

    pub fn trust_roots(&self) -> &[crate::auth::TrustRoot] {
        match self {
            Validator::Static(_) => &[],
            Validator::Notary(v) => &v.trust_roots,
            Validator::Cosign(v) => &v.trust_roots,
            Validator::Notation(v) => &v.trust_roots,
        }
    }

    /// Resolves secrets and parses key/certificate material. Called once
    /// at startup, after deserialization; failures are configuration
    /// errors and abort the process.
    pub fn initialize(&mut self, secrets_dir: &Path) -> Result<(), ValidatorInitError> {
        match self {
            Validator::Static(_) => Ok(()),
            Validator::Notary(v) => v.initialize(secrets_dir),
            Validator::Cosign(v) => v.initialize(secrets_dir),
            Validator::Notation(v) => v.initialize(secrets_dir),
        }
    }

    /// Validates the image and returns its trusted digest.
    pub async fn validate(
        &self,
        token: &CancellationToken,
        image: &Image,
        opts: &RuleOptions,
    ) -> Result<String, ValidationError> {
        match self {
            Validator::Static(v) => v.validate(image),
            Validator::Notary(v) => v.validate(token, image, opts).await,
            Validator::Cosign(v) => v.validate(token, image, opts).await,
            Validator::Notation(v) => v.validate(image, opts).await,
        }
    }
}
