use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustDataError {
    #[error("error creating notary client: {0}")]
    Client(String),
    #[error("error requesting trust data {role}: {reason}")]
    Request { role: String, reason: String },
    #[error("error acquiring trust data {role}: {status}")]
    Status { role: String, status: String },
    #[error("error parsing trust data for {role}: {reason}")]
    Parse { role: String, reason: String },
    #[error("context cancelled")]
    Cancelled,
    #[error("serialization error for {role}: {reason}")]
    Canonical { role: String, reason: String },
    #[error("error parsing public key {name}: {reason}")]
    Key { name: String, reason: String },
    #[error("no signatures found for root")]
    NoRootSignatures,
    #[error("error validating root signature with key {0}")]
    RootSignature(String),
    #[error("error validating {0} signatures")]
    RoleSignatures(String),
    #[error("{0} trust data expired")]
    Expired(String),
    #[error("no checksums found for {0}")]
    MissingChecksums(String),
    #[error("error validating {0} checksums")]
    ChecksumMismatch(String),
    #[error("delegation {0} not found")]
    DelegationNotFound(String),
    #[error("no delegations found, but the following were required: {0:?}")]
    NoDelegations(Vec<String>),
    #[error("error during download and validation of delegations for targets: {0:?}")]
    DelegationDownload(Vec<String>),
    #[error("validated targets don't contain reference: {0}")]
    ReferenceNotFound(String),
    #[error("digest {digest} resolved for tag {tag} doesn't match given digest {given}")]
    DigestMismatch {
        digest: String,
        tag: String,
        given: String,
    },
    #[error("found {count} digests for image {image}, expected 1")]
    AmbiguousDigest { count: usize, image: String },
}
