mod registry;

pub use registry::{RegistryRepo, EMPTY_AUTH_REGISTRY};

use std::fmt;

use oci_distribution::Reference;
use thiserror::Error;

/// Canonical host of the public Docker index. Unqualified references
/// resolve to this registry.
pub const DEFAULT_DOCKER_REGISTRY: &str = "index.docker.io";

pub const SHA256_PREFIX: &str = "sha256:";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] oci_distribution::ParseError),
    #[error("unable to parse registry {0}")]
    InvalidRegistry(String),
    #[error("unable to parse repository {0}")]
    InvalidRepository(String),
}

/// A container image reference, keeping the verbatim input around next to
/// its parsed parts. Unlike [`oci_distribution::Reference`] the canonical
/// string form renders tag AND digest when both are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    original: String,
    registry: String,
    repository: String,
    tag: String,
    digest: String,
}

impl Image {
    pub fn new(image: &str) -> Result<Self, ImageError> {
        let reference: Reference = image.parse()?;

        // go-containerregistry style canonicalization: the bare public
        // index resolves to index.docker.io
        let registry = match reference.registry() {
            "" | "docker.io" => DEFAULT_DOCKER_REGISTRY.to_string(),
            other => other.to_string(),
        };

        let digest = reference.digest().unwrap_or_default().to_string();
        // tagless references without a digest mean "latest"
        let tag = match reference.tag() {
            Some(tag) => tag.to_string(),
            None if digest.is_empty() => "latest".to_string(),
            None => String::new(),
        };

        Ok(Image {
            original: image.to_string(),
            registry,
            repository: reference.repository().to_string(),
            tag,
            digest,
        })
    }

    pub fn original_string(&self) -> &str {
        &self.original
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Fully qualified repository path, without tag or digest.
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The fully qualified reference: `registry/repo[:tag][@digest]`.
    pub fn name(&self) -> String {
        let mut name = self.context();
        if !self.tag.is_empty() {
            name.push(':');
            name.push_str(&self.tag);
        }
        if !self.digest.is_empty() {
            name.push('@');
            name.push_str(&self.digest);
        }
        name
    }

    /// Notary stores public-index images under `docker.io/...`, so the
    /// `index.` prefix has to be removed.
    pub fn notary_reference(&self) -> String {
        let context = self.context();
        match context.strip_prefix("index.") {
            Some(stripped) if context.starts_with(DEFAULT_DOCKER_REGISTRY) => stripped.to_string(),
            _ => context,
        }
    }

    /// Sets the digest, normalizing missing `sha256:` prefixes. An empty
    /// digest clears the current one.
    pub fn set_digest(&mut self, digest: &str) -> &mut Self {
        if digest.is_empty() || digest.starts_with(SHA256_PREFIX) {
            self.digest = digest.to_string();
        } else {
            self.digest = format!("{SHA256_PREFIX}{digest}");
        }
        self
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
