use std::fs::File;
use std::path::{Path, PathBuf};

use globset::Glob;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use validator::Validate;

use crate::alerting;
use crate::policy::{Match, PolicyError, Rule};
use crate::validators::{Validator, ValidatorInitError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error sanitizing file with baseDir {base:?} and pathElements {elements:?}")]
    Sanitize { base: PathBuf, elements: Vec<String> },
    #[error("error loading file: {0}")]
    Load(#[from] std::io::Error),
    #[error("error parsing file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("validator \"{0}\" not found")]
    ValidatorNotFound(String),
    #[error(transparent)]
    ValidatorInit(#[from] ValidatorInitError),
}

/// Process-wide configuration: validators, policy rules and alerting.
/// Built once at startup, read-only afterwards.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub validators: Vec<Validator>,
    #[serde(rename = "policy")]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub alerting: alerting::Config,
}

impl Config {
    /// Loads and validates the main config file, with the path sanitized
    /// against `base_dir`.
    pub fn load(base_dir: &Path, path_elements: &[&str]) -> Result<Self, ConfigError> {
        let file =
            crate::utils::safe_file_name(base_dir, path_elements).map_err(|_| {
                ConfigError::Sanitize {
                    base: base_dir.to_path_buf(),
                    elements: path_elements.iter().map(|s| s.to_string()).collect(),
                }
            })?;

        let config: Config = serde_yaml::from_reader(File::open(file)?)?;
        config.validate()?;
        debug!("config validated without errors");

        Ok(config)
    }

    /// Resolves secrets, key material and channel names. Failures here
    /// are startup-fatal.
    pub fn initialize(
        &mut self,
        secrets_dir: &Path,
        template_dir: Option<PathBuf>,
    ) -> Result<(), ConfigError> {
        for validator in &mut self.validators {
            validator.initialize(secrets_dir)?;
        }
        self.alerting.finalize(template_dir);
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.validators.is_empty() {
            return Err(ConfigError::Invalid("no validators defined".to_string()));
        }
        if self.rules.is_empty() {
            return Err(ConfigError::Invalid("no policy rules defined".to_string()));
        }

        for rule in &self.rules {
            rule.validate()
                .map_err(|e| ConfigError::Invalid(format!("rule {}: {e}", rule.pattern)))?;
            Glob::new(&wrap_pattern(&rule.pattern)).map_err(|e| {
                ConfigError::Invalid(format!("rule {}: invalid pattern: {e}", rule.pattern))
            })?;
        }

        for validator in &self.validators {
            for trust_root in validator.trust_roots() {
                trust_root.validate().map_err(|e| {
                    ConfigError::Invalid(format!(
                        "validator {}, trust root {}: {e}",
                        validator.name(),
                        trust_root.name
                    ))
                })?;
                if let Some(keyless) = &trust_root.keyless {
                    keyless.validate().map_err(|e| {
                        ConfigError::Invalid(format!(
                            "validator {}, trust root {}: {e}",
                            validator.name(),
                            trust_root.name
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Looks up a validator by name; an empty name resolves to
    /// "default".
    pub fn validator(&self, key: &str) -> Result<&Validator, ConfigError> {
        let key = if key.is_empty() { "default" } else { key };
        self.validators
            .iter()
            .find(|validator| validator.name() == key)
            .ok_or_else(|| ConfigError::ValidatorNotFound(key.to_string()))
    }

    /// Returns the most specific rule matching the image, per the
    /// component-count / prefix-length / literal-length ordering.
    pub fn matching_rule(&self, image: &str) -> Result<Rule, PolicyError> {
        let mut best: Option<Match> = None;

        for rule in &self.rules {
            let matcher = match Glob::new(&wrap_pattern(&rule.pattern)) {
                Ok(glob) => glob.compile_matcher(),
                // patterns were checked at load time
                Err(_) => continue,
            };

            if matcher.is_match(image) {
                let candidate = Match::new(rule.clone(), image);
                best = Some(match best.take() {
                    Some(current) => candidate.compare(current),
                    None => candidate,
                });
            }
        }

        best.map(|m| m.rule).ok_or(PolicyError::NoMatchingRule)
    }
}

/// Patterns are implicitly wrapped with `*` on both ends.
fn wrap_pattern(pattern: &str) -> String {
    let mut wrapped = pattern.to_string();
    if !wrapped.starts_with('*') {
        wrapped = format!("*{wrapped}");
    }
    if !wrapped.ends_with('*') {
        wrapped = format!("{wrapped}*");
    }
    wrapped
}
