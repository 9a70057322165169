use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use super::ImageError;

/// Sentinel used by credential entries that carry no explicit registry.
/// Rewritten to the validator's host at config load time.
pub const EMPTY_AUTH_REGISTRY: &str = "EMPTYAUTH";

lazy_static! {
    static ref REGISTRY_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(:[0-9]+)?$").unwrap();
    static ref REPOSITORY_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*(/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*$").unwrap();
}

/// A `registry[/repository]` pair, used to key credential stores and to
/// normalize validator host strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRepo {
    registry: String,
    repo: String,
}

impl RegistryRepo {
    pub fn new(s: &str) -> Result<Self, ImageError> {
        if s == EMPTY_AUTH_REGISTRY {
            return Ok(RegistryRepo {
                registry: s.to_string(),
                repo: String::new(),
            });
        }

        let mut trimmed = s;
        for prefix in ["https://", "http://"] {
            trimmed = trimmed.strip_prefix(prefix).unwrap_or(trimmed);
        }
        // legacy docker-index auth keys carry a /v1/ suffix
        if (trimmed.starts_with("index.docker.io") || trimmed.starts_with("docker.io"))
            && trimmed.ends_with("/v1/")
        {
            trimmed = trimmed.trim_end_matches("/v1/");
        }

        let (registry, repo) = match trimmed.split_once('/') {
            Some((registry, repo)) => (registry, repo),
            None => (trimmed, ""),
        };

        if !REGISTRY_RE.is_match(registry) {
            return Err(ImageError::InvalidRegistry(registry.to_string()));
        }
        if !repo.is_empty() && !REPOSITORY_RE.is_match(repo) {
            return Err(ImageError::InvalidRepository(repo.to_string()));
        }

        Ok(RegistryRepo {
            registry: registry.to_string(),
            repo: repo.to_string(),
        })
    }
}

impl fmt::Display for RegistryRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.repo.is_empty() {
            write!(f, "{}", self.registry)
        } else {
            write!(f, "{}/{}", self.registry, self.repo)
        }
    }
}
