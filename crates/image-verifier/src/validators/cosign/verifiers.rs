use regex::Regex;
use sigstore::cosign::verification_constraint::{PublicKeyVerifier, VerificationConstraint};
use sigstore::cosign::signature_layers::CertificateSubject;
use sigstore::cosign::SignatureLayer;
use sigstore::crypto::SigningScheme;

use super::CosignError;
use crate::auth::{Keyless, TrustRoot};

/// A per-trust-root signature check: either a public key or a keyless
/// identity constraint.
pub(crate) struct Verifier {
    pub name: String,
    constraint: Box<dyn VerificationConstraint + Send + Sync>,
}

impl Verifier {
    pub(crate) fn from_trust_root(trust_root: &TrustRoot) -> Result<Self, CosignError> {
        let constraint: Box<dyn VerificationConstraint + Send + Sync> =
            if let Some(key) = &trust_root.key {
                Box::new(
                    PublicKeyVerifier::new(key.as_bytes(), &SigningScheme::default())
                        .map_err(|e| CosignError::Verifiers(e.to_string()))?,
                )
            } else if let Some(keyless) = &trust_root.keyless {
                Box::new(KeylessVerifier::new(keyless)?)
            } else {
                return Err(CosignError::Verifiers(format!(
                    "trust root {} carries neither key nor keyless identity",
                    trust_root.name
                )));
            };

        Ok(Verifier {
            name: trust_root.name.clone(),
            constraint,
        })
    }

    pub(crate) fn matches(&self, layer: &SignatureLayer) -> bool {
        self.constraint.verify(layer).unwrap_or(false)
    }
}

#[derive(Debug)]
enum IdentityMatcher {
    Exact(String),
    Pattern(Regex),
}

impl IdentityMatcher {
    fn new(exact: &Option<String>, pattern: &Option<String>) -> Result<Self, CosignError> {
        if let Some(exact) = exact {
            return Ok(IdentityMatcher::Exact(exact.clone()));
        }
        let pattern = pattern
            .as_deref()
            .ok_or_else(|| CosignError::Verifiers("incomplete keyless identity".to_string()))?;
        Ok(IdentityMatcher::Pattern(Regex::new(pattern).map_err(
            |e| CosignError::Verifiers(format!("invalid identity regex: {e}")),
        )?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            IdentityMatcher::Exact(expected) => expected == value,
            IdentityMatcher::Pattern(regex) => regex.is_match(value),
        }
    }
}

/// Constraint binding a signature to a certificate identity instead of a
/// long-lived key. The certificate chain itself has been checked by the
/// cosign client against the configured root material.
#[derive(Debug)]
struct KeylessVerifier {
    issuer: IdentityMatcher,
    subject: IdentityMatcher,
}

impl KeylessVerifier {
    fn new(keyless: &Keyless) -> Result<Self, CosignError> {
        Ok(KeylessVerifier {
            issuer: IdentityMatcher::new(&keyless.issuer, &keyless.issuer_regex)?,
            subject: IdentityMatcher::new(&keyless.subject, &keyless.subject_regex)?,
        })
    }
}

impl VerificationConstraint for KeylessVerifier {
    fn verify(&self, layer: &SignatureLayer) -> sigstore::errors::Result<bool> {
        let certificate_signature = match &layer.certificate_signature {
            Some(certificate_signature) => certificate_signature,
            None => return Ok(false),
        };

        let issuer_matches = certificate_signature
            .issuer
            .as_deref()
            .map(|issuer| self.issuer.matches(issuer))
            .unwrap_or(false);

        let subject_value = match &certificate_signature.subject {
            CertificateSubject::Email(email) => email,
            CertificateSubject::Uri(uri) => uri,
        };

        Ok(issuer_matches && self.subject.matches(subject_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matcher() {
        let matcher =
            IdentityMatcher::new(&Some("user@example.com".to_string()), &None).unwrap();
        assert!(matcher.matches("user@example.com"));
        assert!(!matcher.matches("other@example.com"));
    }

    #[test]
    fn pattern_matcher() {
        let matcher =
            IdentityMatcher::new(&None, &Some(r".*@example\.com$".to_string())).unwrap();
        assert!(matcher.matches("anyone@example.com"));
        assert!(!matcher.matches("anyone@elsewhere.org"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(IdentityMatcher::new(&None, &Some("(unclosed".to_string())).is_err());
    }

    #[test]
    fn trust_root_without_credentials_is_rejected() {
        let trust_root = TrustRoot {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(Verifier::from_trust_root(&trust_root).is_err());
    }

    #[test]
    fn keyless_trust_root_builds_verifier() {
        let trust_root = TrustRoot {
            name: "keyless".to_string(),
            keyless: Some(Keyless {
                issuer: Some("https://token.actions.githubusercontent.com".to_string()),
                subject_regex: Some(".*".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let verifier = Verifier::from_trust_root(&trust_root).unwrap();
        assert_eq!(verifier.name, "keyless");
    }
}
