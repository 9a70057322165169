mod matching;

pub use matching::Match;

use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("no matching rule")]
    NoMatchingRule,
}

/// How a validated image reference is handed back to the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ValidationMode {
    /// Rewrite the reference to its digest-qualified form.
    #[default]
    #[serde(rename = "mutate")]
    Mutate,
    /// Only verify that a passing signed artifact exists, leave the
    /// reference untouched.
    #[serde(rename = "insecureValidateOnly")]
    InsecureValidateOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerificationLevel {
    #[default]
    Strict,
    Permissive,
    Audit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampVerification {
    #[default]
    Always,
    AfterCertExpiry,
    Never,
}

/// A single policy entry, binding an image pattern to a validator and its
/// options.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
    /// Pattern to match image references against.
    #[validate(length(min = 1))]
    pub pattern: String,
    /// Name of the validator to use; empty resolves to "default".
    #[serde(default)]
    pub validator: String,
    #[serde(default)]
    #[validate(nested)]
    pub with: RuleOptions,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_rule_options"))]
pub struct RuleOptions {
    /// Name of the trust root to use, or the all-quantifier '*'.
    #[serde(default)]
    pub trust_root: String,
    /// Unset means "validator default" (true).
    #[serde(default)]
    pub verify_in_transparency_log: Option<bool>,
    #[serde(default, rename = "verifySCT")]
    pub verify_sct: Option<bool>,
    /// Number of trust roots that have to produce a valid signature.
    #[serde(default)]
    pub threshold: usize,
    /// Trust roots whose signatures are mandatory.
    #[serde(default)]
    pub required: Vec<String>,
    /// Delegation roles that have to sign off the image.
    #[serde(default)]
    pub delegations: Vec<String>,
    #[serde(default, rename = "mode")]
    pub validation_mode: Option<ValidationMode>,
    #[serde(default)]
    pub verification_level: Option<VerificationLevel>,
    #[serde(default)]
    pub verify_timestamp: Option<TimestampVerification>,
}

impl RuleOptions {
    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode.unwrap_or_default()
    }
}

fn validate_rule_options(opts: &RuleOptions) -> Result<(), ValidationError> {
    if !opts.required.is_empty() && !opts.delegations.is_empty() {
        return Err(ValidationError::new(
            "required and delegations are mutually exclusive",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_full_options() {
        let yaml = r#"
pattern: "registry.io/*"
validator: myvalidator
with:
  trustRoot: "*"
  verifySCT: false
  threshold: 2
  required: ["alice", "bob"]
  mode: insecureValidateOnly
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.pattern, "registry.io/*");
        assert_eq!(rule.validator, "myvalidator");
        assert_eq!(rule.with.trust_root, "*");
        assert_eq!(rule.with.verify_sct, Some(false));
        assert_eq!(rule.with.verify_in_transparency_log, None);
        assert_eq!(rule.with.threshold, 2);
        assert_eq!(rule.with.required, vec!["alice", "bob"]);
        assert_eq!(
            rule.with.validation_mode(),
            ValidationMode::InsecureValidateOnly
        );
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn validation_mode_defaults_to_mutate() {
        let rule: Rule = serde_yaml::from_str("pattern: \"*\"").unwrap();
        assert_eq!(rule.with.validation_mode(), ValidationMode::Mutate);
    }

    #[test]
    fn required_and_delegations_are_exclusive() {
        let yaml = r#"
pattern: "*"
with:
  required: ["a"]
  delegations: ["b"]
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Rule, _> = serde_yaml::from_str("pattern: \"*\"\nbogus: true");
        assert!(result.is_err());
    }
}
