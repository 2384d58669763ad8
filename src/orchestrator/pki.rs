//! Global registry PKI: the CA and the token signing certificate
//!
//! The `registry-pki` Secret is the source of truth. The copy kept in the
//! orchestrator state is a backup used to restore the Secret when it is
//! deleted or corrupted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::patch::{owned_secret, EventType, PatchCollector, SecretData};
use crate::constants;
use crate::error::{Error, Result};
use crate::pki::{self, CertKey};

pub const KEY_CA_CERT: &str = "registry-ca.crt";
pub const KEY_CA_KEY: &str = "registry-ca.key";
pub const KEY_TOKEN_CERT: &str = "token.crt";
pub const KEY_TOKEN_KEY: &str = "token.key";

pub const EVENT_PKI_GENERATED: &str = "PKIGenerated";
pub const EVENT_PKI_NOT_FOUND_RESTORED: &str = "PKINotfoundRestored";
pub const EVENT_PKI_INVALID_RESTORED: &str = "PKIInvalidRestored";
pub const EVENT_PKI_FATAL: &str = "PKIFatal";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPki {
    pub ca: CertKey,
    pub token: CertKey,
}

impl GlobalPki {
    pub fn generate() -> Result<Self> {
        let ca = pki::generate_ca(constants::CA_COMMON_NAME)?;
        let token = pki::generate_cert(constants::TOKEN_COMMON_NAME, &ca, &[])?;
        Ok(Self { ca, token })
    }

    pub fn validate(&self) -> Result<()> {
        let ca = pki::decode_cert_key(self.ca.cert.as_bytes(), self.ca.key.as_bytes())?;
        let token = pki::decode_cert_key(self.token.cert.as_bytes(), self.token.key.as_bytes())?;
        pki::validate_cert_with_ca_chain(&ca.cert, &[&ca.cert])?;
        pki::validate_cert_with_ca_chain(&token.cert, &[&ca.cert])?;
        Ok(())
    }

    pub fn from_secret_data(data: &SecretData) -> Result<Self> {
        let field = |key: &str| {
            data.get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::PkiDecode(format!("field {key} is empty")))
        };
        let ca = pki::decode_cert_key(field(KEY_CA_CERT)?, field(KEY_CA_KEY)?)?;
        let token = pki::decode_cert_key(field(KEY_TOKEN_CERT)?, field(KEY_TOKEN_KEY)?)?;
        let decoded = Self { ca, token };
        decoded.validate()?;
        Ok(decoded)
    }

    pub fn to_secret_data(&self) -> SecretData {
        let (ca_cert, ca_key) = pki::encode_cert_key(&self.ca);
        let (token_cert, token_key) = pki::encode_cert_key(&self.token);
        BTreeMap::from([
            (KEY_CA_CERT.to_string(), ca_cert),
            (KEY_CA_KEY.to_string(), ca_key),
            (KEY_TOKEN_CERT.to_string(), token_cert),
            (KEY_TOKEN_KEY.to_string(), token_key),
        ])
    }
}

#[derive(Debug)]
pub enum PkiOutcome {
    Ready {
        pki: GlobalPki,
        /// A new CA replaced whatever existed before
        replaced: bool,
    },
    /// The Secret is corrupted and no valid backup exists
    Fatal(String),
}

/// Ensure the global PKI exists, restoring or generating it as needed
pub fn process(
    backup: &mut Option<GlobalPki>,
    secret: Option<&SecretData>,
    patches: &mut PatchCollector,
) -> Result<PkiOutcome> {
    let secret_error = match secret.map(GlobalPki::from_secret_data) {
        Some(Ok(current)) => {
            if backup.as_ref() != Some(&current) {
                info!("Registry PKI loaded from secret");
                *backup = Some(current.clone());
            }
            return Ok(PkiOutcome::Ready {
                pki: current,
                replaced: false,
            });
        }
        Some(Err(e)) => Some(e),
        None => None,
    };

    let valid_backup = backup.as_ref().filter(|b| match b.validate() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "In-memory registry PKI backup is invalid");
            false
        }
    });

    if let Some(restored) = valid_backup.cloned() {
        let (reason, message) = match &secret_error {
            Some(e) => (
                EVENT_PKI_INVALID_RESTORED,
                format!("Registry PKI secret is invalid ({e}), restored from backup"),
            ),
            None => (
                EVENT_PKI_NOT_FOUND_RESTORED,
                "Registry PKI secret not found, restored from backup".to_string(),
            ),
        };
        warn!(reason, "{message}");
        patches.event(EventType::Warning, reason, message);
        patches.apply_secret(owned_secret(
            constants::PKI_SECRET,
            None,
            &[],
            restored.to_secret_data(),
        ));
        return Ok(PkiOutcome::Ready {
            pki: restored,
            replaced: false,
        });
    }

    if let Some(e) = secret_error {
        let message = format!("Registry PKI secret is invalid and no backup is available: {e}");
        warn!("{message}");
        patches.event(EventType::Warning, EVENT_PKI_FATAL, message.clone());
        return Ok(PkiOutcome::Fatal(message));
    }

    let generated = GlobalPki::generate()?;
    info!("Generated new registry PKI");
    patches.event(
        EventType::Normal,
        EVENT_PKI_GENERATED,
        "Registry PKI generated",
    );
    patches.apply_secret(owned_secret(
        constants::PKI_SECRET,
        None,
        &[],
        generated.to_secret_data(),
    ));
    *backup = Some(generated.clone());

    Ok(PkiOutcome::Ready {
        pki: generated,
        replaced: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_when_nothing_exists() {
        let mut backup = None;
        let mut patches = PatchCollector::new();

        let outcome = process(&mut backup, None, &mut patches).unwrap();
        let PkiOutcome::Ready { pki, replaced } = outcome else {
            panic!("expected ready PKI");
        };
        assert!(replaced);
        assert_eq!(backup.as_ref(), Some(&pki));
        assert_eq!(patches.applied_secret_names(), vec![constants::PKI_SECRET]);
        assert_eq!(patches.event_reasons(), vec![EVENT_PKI_GENERATED]);
    }

    #[test]
    fn valid_secret_is_used_without_writes() {
        let existing = GlobalPki::generate().unwrap();
        let data = existing.to_secret_data();
        let mut backup = None;
        let mut patches = PatchCollector::new();

        let outcome = process(&mut backup, Some(&data), &mut patches).unwrap();
        assert!(matches!(outcome, PkiOutcome::Ready { replaced: false, .. }));
        assert_eq!(backup, Some(existing));
        assert!(patches.is_empty());
    }

    #[test]
    fn missing_secret_is_restored_from_backup() {
        let existing = GlobalPki::generate().unwrap();
        let mut backup = Some(existing.clone());
        let mut patches = PatchCollector::new();

        let outcome = process(&mut backup, None, &mut patches).unwrap();
        let PkiOutcome::Ready { pki, replaced } = outcome else {
            panic!("expected ready PKI");
        };
        assert!(!replaced);
        assert_eq!(pki, existing);
        assert_eq!(patches.event_reasons(), vec![EVENT_PKI_NOT_FOUND_RESTORED]);
    }

    #[test]
    fn corrupted_secret_without_backup_is_fatal() {
        let mut data = GlobalPki::generate().unwrap().to_secret_data();
        data.insert(KEY_TOKEN_CERT.to_string(), b"garbage".to_vec());
        let mut backup = None;
        let mut patches = PatchCollector::new();

        let outcome = process(&mut backup, Some(&data), &mut patches).unwrap();
        assert!(matches!(outcome, PkiOutcome::Fatal(_)));
        assert!(backup.is_none());
        assert!(patches.applied_secret_names().is_empty());
        assert_eq!(patches.event_reasons(), vec![EVENT_PKI_FATAL]);
    }

    #[test]
    fn corrupted_secret_with_backup_is_restored() {
        let existing = GlobalPki::generate().unwrap();
        let mut data = existing.to_secret_data();
        data.insert(KEY_CA_KEY.to_string(), b"garbage".to_vec());
        let mut backup = Some(existing);
        let mut patches = PatchCollector::new();

        process(&mut backup, Some(&data), &mut patches).unwrap();
        assert_eq!(patches.event_reasons(), vec![EVENT_PKI_INVALID_RESTORED]);
        assert_eq!(patches.applied_secret_names(), vec![constants::PKI_SECRET]);
    }
}
