use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use tracing::{info, warn};

pub const AUTOMATIC_CHILD_APPROVAL: &str = "AUTOMATIC_CHILD_APPROVAL";
pub const AUTOMATIC_UNCHANGED_APPROVAL: &str = "AUTOMATIC_UNCHANGED_APPROVAL";
pub const DETECTION_MODE: &str = "DETECTION_MODE";
pub const RESOURCE_VALIDATION_MODE: &str = "RESOURCE_VALIDATION_MODE";
pub const CACHE_EXPIRY_SECONDS: &str = "CACHE_EXPIRY_SECONDS";
pub const CACHE_ERRORS: &str = "CACHE_ERRORS";
pub const POD_NAME: &str = "POD_NAME";

const DEFAULT_CACHE_EXPIRY_SECONDS: i64 = 30;

/// Checks a feature flag given as env var, falling back to the flag's
/// documented default on unset or unparsable values.
pub fn feature_flag_on(flag: &str) -> bool {
    let value = std::env::var(flag).unwrap_or_default();
    match value.parse::<bool>() {
        Ok(enabled) => enabled,
        Err(_) => {
            let default = matches!(flag, AUTOMATIC_CHILD_APPROVAL);
            if !value.is_empty() {
                warn!(
                    flag = flag,
                    value = value.as_str(),
                    default = default,
                    "invalid value for feature flag, using default"
                );
            }
            default
        }
    }
}

pub fn automatic_child_approval() -> bool {
    feature_flag_on(AUTOMATIC_CHILD_APPROVAL)
}

pub fn automatic_unchanged_approval() -> bool {
    feature_flag_on(AUTOMATIC_UNCHANGED_APPROVAL)
}

pub fn detection_mode() -> bool {
    feature_flag_on(DETECTION_MODE)
}

/// Whether every supported workload kind is enforced, or only Pods.
pub fn block_all_resources() -> bool {
    let mode = std::env::var(RESOURCE_VALIDATION_MODE).unwrap_or_default();
    match mode.to_lowercase().as_str() {
        "all" | "" => true,
        "podsonly" => false,
        _ => {
            info!(
                value = mode.as_str(),
                "invalid value for resource validation mode, defaulting to 'all'"
            );
            true
        }
    }
}

/// TTL of cache entries; non-positive disables caching.
pub fn cache_expiry_seconds() -> i64 {
    std::env::var(CACHE_EXPIRY_SECONDS)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_CACHE_EXPIRY_SECONDS)
}

/// Whether failed validations are written to the cache as well.
pub fn cache_errors() -> bool {
    std::env::var(CACHE_ERRORS)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(true)
}

pub fn pod_name() -> String {
    std::env::var(POD_NAME).unwrap_or_default()
}

/// Process configuration resolved from the command line.
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub cert_file: String,
    pub key_file: String,
    pub config_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub alert_template_dir: PathBuf,
    pub redis_cert_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
}

impl ServerSettings {
    pub fn from_args(matches: &ArgMatches) -> Result<Self> {
        let addr = matches
            .get_one::<String>("addr")
            .expect("clap should have set a default value")
            .parse()
            .map_err(|e| anyhow!("error parsing arguments: {}", e))?;

        let get = |name: &str| -> String {
            matches
                .get_one::<String>(name)
                .expect("clap should have set a default value")
                .to_owned()
        };

        Ok(ServerSettings {
            addr,
            cert_file: get("cert-file"),
            key_file: get("key-file"),
            config_dir: PathBuf::from(get("config-dir")),
            secrets_dir: PathBuf::from(get("secrets-dir")),
            alert_template_dir: PathBuf::from(get("alert-template-dir")),
            redis_cert_dir: PathBuf::from(get("redis-cert-dir")),
            log_level: get("log-level"),
            log_format: get("log-format"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    #[test]
    #[serial]
    fn feature_flag_defaults() {
        for flag in [
            AUTOMATIC_CHILD_APPROVAL,
            AUTOMATIC_UNCHANGED_APPROVAL,
            DETECTION_MODE,
        ] {
            std::env::remove_var(flag);
        }
        assert!(automatic_child_approval());
        assert!(!automatic_unchanged_approval());
        assert!(!detection_mode());
    }

    #[test]
    #[serial]
    fn feature_flag_parses_env() {
        std::env::set_var(AUTOMATIC_CHILD_APPROVAL, "false");
        assert!(!automatic_child_approval());
        std::env::set_var(AUTOMATIC_CHILD_APPROVAL, "not-a-bool");
        assert!(automatic_child_approval());
        std::env::remove_var(AUTOMATIC_CHILD_APPROVAL);
    }

    #[test]
    #[serial]
    fn resource_validation_mode() {
        std::env::remove_var(RESOURCE_VALIDATION_MODE);
        assert!(block_all_resources());
        std::env::set_var(RESOURCE_VALIDATION_MODE, "podsOnly");
        assert!(!block_all_resources());
        std::env::set_var(RESOURCE_VALIDATION_MODE, "nonsense");
        assert!(block_all_resources());
        std::env::remove_var(RESOURCE_VALIDATION_MODE);
    }

    #[test]
    #[serial]
    fn cache_settings() {
        std::env::remove_var(CACHE_EXPIRY_SECONDS);
        std::env::remove_var(CACHE_ERRORS);
        assert_eq!(cache_expiry_seconds(), 30);
        assert!(cache_errors());

        std::env::set_var(CACHE_EXPIRY_SECONDS, "0");
        std::env::set_var(CACHE_ERRORS, "false");
        assert_eq!(cache_expiry_seconds(), 0);
        assert!(!cache_errors());

        std::env::remove_var(CACHE_EXPIRY_SECONDS);
        std::env::remove_var(CACHE_ERRORS);
    }
}
