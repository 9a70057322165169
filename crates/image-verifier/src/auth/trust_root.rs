use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError};

#[derive(Error, Debug)]
pub enum TrustRootError {
    #[error("unable to find trust root {0}")]
    NotFound(String),
    #[error("no trust roots defined for key references {0:?}")]
    NoneDefined(Vec<String>),
}

/// A named credential from which signature trust is derived: exactly one
/// of an inline/KMS public key, a certificate (optionally with a
/// timestamp certificate), or a keyless identity.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_trust_root"))]
pub struct TrustRoot {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default, rename = "tsCert")]
    pub ts_cert: Option<String>,
    #[serde(default)]
    pub keyless: Option<Keyless>,
}

/// Identity binding for keyless signatures. Issuer and subject each come
/// as either a literal or a regex, never both.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_keyless"))]
pub struct Keyless {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub issuer_regex: Option<String>,
    #[serde(default)]
    pub subject_regex: Option<String>,
}

fn validate_trust_root(tr: &TrustRoot) -> Result<(), ValidationError> {
    let provided = [tr.key.is_some(), tr.cert.is_some(), tr.keyless.is_some()]
        .into_iter()
        .filter(|present| *present)
        .count();
    if provided != 1 {
        return Err(ValidationError::new(
            "exactly one of key, cert or keyless must be set",
        ));
    }
    if tr.ts_cert.is_some() && tr.cert.is_none() {
        return Err(ValidationError::new("tsCert requires cert"));
    }
    Ok(())
}

fn validate_keyless(keyless: &Keyless) -> Result<(), ValidationError> {
    if keyless.issuer.is_some() == keyless.issuer_regex.is_some() {
        return Err(ValidationError::new(
            "exactly one of issuer or issuerRegex must be set",
        ));
    }
    if keyless.subject.is_some() == keyless.subject_regex.is_some() {
        return Err(ValidationError::new(
            "exactly one of subject or subjectRegex must be set",
        ));
    }
    Ok(())
}

/// Returns the trust roots matching the given key references by name. The
/// all-quantifier `*` selects every configured trust root. Without any
/// reference and `use_default`, the trust root named "default" is used.
pub fn select_trust_roots<'a>(
    key_refs: &[String],
    trust_roots: &'a [TrustRoot],
    use_default: bool,
) -> Result<Vec<&'a TrustRoot>, TrustRootError> {
    let default_refs = vec!["default".to_string()];
    let no_key_ref = key_refs.is_empty() || (key_refs.len() == 1 && key_refs[0].is_empty());
    let key_refs: &[String] = if no_key_ref && use_default {
        &default_refs
    } else {
        key_refs
    };

    if key_refs.len() == 1 && key_refs[0] == "*" {
        return Ok(trust_roots.iter().collect());
    }

    let mut selected = Vec::with_capacity(key_refs.len());
    for key_ref in key_refs {
        let tr = trust_roots
            .iter()
            .find(|tr| &tr.name == key_ref)
            .ok_or_else(|| TrustRootError::NotFound(key_ref.clone()))?;
        selected.push(tr);
    }

    if selected.is_empty() {
        return Err(TrustRootError::NoneDefined(key_refs.to_vec()));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trust_roots() -> Vec<TrustRoot> {
        ["default", "alice", "bob"]
            .iter()
            .map(|name| TrustRoot {
                name: name.to_string(),
                key: Some("key".to_string()),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn selects_by_name() {
        let roots = trust_roots();
        let selected =
            select_trust_roots(&["alice".to_string(), "bob".to_string()], &roots, true).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "alice");
    }

    #[test]
    fn empty_reference_selects_default() {
        let roots = trust_roots();
        let selected = select_trust_roots(&[String::new()], &roots, true).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "default");
    }

    #[test]
    fn wildcard_selects_all() {
        let roots = trust_roots();
        let selected = select_trust_roots(&["*".to_string()], &roots, true).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn unknown_name_errors() {
        let roots = trust_roots();
        let err = select_trust_roots(&["mallory".to_string()], &roots, true).unwrap_err();
        assert!(matches!(err, TrustRootError::NotFound(name) if name == "mallory"));
    }

    #[test]
    fn trust_root_requires_exactly_one_credential() {
        let tr = TrustRoot {
            name: "broken".to_string(),
            key: Some("key".to_string()),
            cert: Some("cert".to_string()),
            ..Default::default()
        };
        assert!(tr.validate().is_err());

        let tr = TrustRoot {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(tr.validate().is_err());
    }

    #[test]
    fn keyless_requires_one_of_each_pair() {
        let keyless = Keyless {
            issuer: Some("https://issuer".to_string()),
            subject: Some("user@example.com".to_string()),
            ..Default::default()
        };
        assert!(keyless.validate().is_ok());

        let keyless = Keyless {
            issuer: Some("https://issuer".to_string()),
            issuer_regex: Some(".*".to_string()),
            subject: Some("user@example.com".to_string()),
            ..Default::default()
        };
        assert!(keyless.validate().is_err());
    }
}
