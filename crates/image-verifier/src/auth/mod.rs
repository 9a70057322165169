mod trust_root;

pub use trust_root::{select_trust_roots, Keyless, TrustRoot, TrustRootError};

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::image::{RegistryRepo, EMPTY_AUTH_REGISTRY};
use crate::utils::safe_file_name;

/// File holding structured credentials inside a mounted secret.
const DEFAULT_AUTH_FILE: &str = "secret.yaml";
/// Docker-style credential file inside a mounted secret.
const DOCKER_AUTH_FILE: &str = ".dockerconfigjson";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no authentication file for secret {0}")]
    NoAuthFile(String),
    #[error("error reading authentication file {file}: {reason}")]
    UnreadableAuthFile { file: String, reason: String },
    #[error("unable to parse registry {0}")]
    InvalidRegistry(String),
}

/// Registry credentials of a validator, declared in its config as a
/// reference to a mounted secret.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Auth {
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Filled from the secret files at config load time.
    #[serde(skip)]
    pub auth_configs: HashMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthEntry {
    pub username: String,
    pub password: String,
}

impl Auth {
    /// Reads the mounted secret files, if a secret is configured. There is
    /// either a `secret.yaml` or a `.dockerconfigjson`; whichever is found
    /// first is used.
    pub fn load(&mut self, secrets_dir: &Path) -> Result<(), AuthError> {
        let secret_name = match &self.secret_name {
            Some(name) => name.clone(),
            None => return Ok(()),
        };

        for (file_name, read) in [
            (DEFAULT_AUTH_FILE, read_default_auth_file as ReadFn),
            (DOCKER_AUTH_FILE, read_docker_auth_file as ReadFn),
        ] {
            if let Ok(file) = safe_file_name(secrets_dir, &[&secret_name, file_name]) {
                self.auth_configs =
                    read(&file).map_err(|reason| AuthError::UnreadableAuthFile {
                        file: file.display().to_string(),
                        reason,
                    })?;
                return Ok(());
            }
        }

        Err(AuthError::NoAuthFile(secret_name))
    }

    /// Looks up credentials for a registry (or registry/repo) string. The
    /// longest configured key that prefixes the queried string wins.
    pub fn look_up(&self, image: &str) -> AuthEntry {
        let best_hit = self
            .auth_configs
            .keys()
            .filter(|key| image.starts_with(key.as_str()))
            .max_by_key(|key| key.len());

        if let Some(key) = best_hit {
            return self.auth_configs[key].clone();
        }

        if !self.auth_configs.is_empty() {
            warn!(image = image, "no credentials found");
        }

        AuthEntry::default()
    }

    /// Rewrites the "no explicit registry" sentinel entry to the given
    /// host. Used by validators whose secret does not name a registry.
    pub fn rewrite_empty_registry(&mut self, host: &str) -> Result<(), AuthError> {
        if self.auth_configs.len() != 1 {
            return Ok(());
        }
        if let Some(entry) = self.auth_configs.remove(EMPTY_AUTH_REGISTRY) {
            let rr = RegistryRepo::new(host)
                .map_err(|_| AuthError::InvalidRegistry(host.to_string()))?;
            self.auth_configs.insert(rr.to_string(), entry);
        }
        Ok(())
    }
}

type ReadFn = fn(&Path) -> Result<HashMap<String, AuthEntry>, String>;

#[derive(Deserialize)]
struct DefaultAuthFile {
    username: String,
    password: String,
    #[serde(default)]
    registry: String,
}

fn read_default_auth_file(path: &Path) -> Result<HashMap<String, AuthEntry>, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let parsed: DefaultAuthFile = serde_yaml::from_slice(&bytes).map_err(|e| e.to_string())?;

    // registry is optional; the sentinel is rewritten by the validator
    let registry = if parsed.registry.is_empty() {
        EMPTY_AUTH_REGISTRY.to_string()
    } else {
        parsed.registry
    };
    let rr = RegistryRepo::new(&registry).map_err(|e| e.to_string())?;

    Ok(HashMap::from([(
        rr.to_string(),
        AuthEntry {
            username: parsed.username,
            password: parsed.password,
        },
    )]))
}

#[derive(Deserialize)]
struct DockerConfigRaw {
    auths: HashMap<String, DockerAuthRaw>,
}

#[derive(Deserialize)]
struct DockerAuthRaw {
    // `auth` is optional: a syntactically valid config can still miss the
    // field, and such hosts are skipped instead of failing the load
    auth: Option<String>,
}

fn read_docker_auth_file(path: &Path) -> Result<HashMap<String, AuthEntry>, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let parsed: DockerConfigRaw = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;

    let mut auth_configs = HashMap::new();
    for (host, raw) in parsed.auths {
        let entry = match decode_docker_auth(&raw) {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => {
                error!(host = host.as_str(), error = e.as_str(), "error parsing host configuration, host ignored");
                continue;
            }
        };
        let rr = RegistryRepo::new(&host).map_err(|e| e.to_string())?;
        auth_configs.insert(rr.to_string(), entry);
    }

    Ok(auth_configs)
}

fn decode_docker_auth(raw: &DockerAuthRaw) -> Result<Option<AuthEntry>, String> {
    let auth = match &raw.auth {
        Some(auth) => auth,
        None => return Ok(None),
    };
    let decoded = general_purpose::STANDARD
        .decode(auth)
        .map_err(|_| "invalid base64 encoding".to_string())?;
    let decoded = String::from_utf8(decoded).map_err(|_| "auth is not utf8".to_string())?;

    match decoded.split_once(':') {
        Some((username, password)) => Ok(Some(AuthEntry {
            username: username.to_string(),
            password: password.to_string(),
        })),
        None => Err("basic auth not in the form username:password".to_string()),
    }
}
