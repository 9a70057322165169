use std::collections::HashMap;

use super::TrustStoreError;
use crate::auth::TrustRoot;
use crate::validators::ValidatorInitError;

/// Which kind of certificate a trust-store entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustStoreKind {
    Ca,
    TimestampAuthority,
}

/// Parsed certificates of the validator's trust roots, keyed by trust
/// root name and certificate kind. Certificates are stored as DER.
#[derive(Debug, Default)]
pub struct InMemoryTrustStore {
    certs: HashMap<(String, TrustStoreKind), Vec<Vec<u8>>>,
}

impl InMemoryTrustStore {
    pub fn new(trust_roots: &[TrustRoot]) -> Result<Self, ValidatorInitError> {
        let mut certs: HashMap<(String, TrustStoreKind), Vec<Vec<u8>>> = HashMap::new();

        for trust_root in trust_roots {
            let cert = trust_root.cert.as_deref().ok_or_else(|| {
                ValidatorInitError::MissingTrustRootCertificate(trust_root.name.clone())
            })?;
            certs.insert(
                (trust_root.name.clone(), TrustStoreKind::Ca),
                parse_pem_chain(&trust_root.name, cert)?,
            );

            if let Some(ts_cert) = trust_root.ts_cert.as_deref() {
                certs.insert(
                    (trust_root.name.clone(), TrustStoreKind::TimestampAuthority),
                    parse_pem_chain(&trust_root.name, ts_cert)?,
                );
            }
        }

        Ok(InMemoryTrustStore { certs })
    }

    pub fn certificates(&self, name: &str, kind: TrustStoreKind) -> Result<&[Vec<u8>], TrustStoreError> {
        self.certs
            .get(&(name.to_string(), kind))
            .map(|certs| certs.as_slice())
            .ok_or_else(|| TrustStoreError::NoCertificates(name.to_string()))
    }

    pub fn has_timestamp_authority(&self, name: &str) -> bool {
        self.certs
            .contains_key(&(name.to_string(), TrustStoreKind::TimestampAuthority))
    }
}

fn parse_pem_chain(name: &str, pem_data: &str) -> Result<Vec<Vec<u8>>, ValidatorInitError> {
    let blocks = pem::parse_many(pem_data.as_bytes()).map_err(|e| {
        ValidatorInitError::InvalidTrustRoot {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;
    if blocks.is_empty() {
        return Err(ValidatorInitError::InvalidTrustRoot {
            name: name.to_string(),
            reason: "no PEM blocks found".to_string(),
        });
    }
    Ok(blocks.into_iter().map(|block| block.into_contents()).collect())
}
