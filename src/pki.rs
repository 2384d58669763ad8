//! Certificate primitives for the embedded registry
//!
//! The CA is ECDSA P-256 and valid for ten years. Leaves are RSA-2048 and
//! expire one hour before their issuing CA. Everything travels as PEM.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

use crate::error::{Error, Result};

const CA_VALIDITY_DAYS: i64 = 3650;
const RSA_KEY_BITS: usize = 2048;

/// A certificate together with its private key, both PEM encoded
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertKey {
    pub cert: String,
    pub key: String,
}

impl CertKey {
    pub fn is_empty(&self) -> bool {
        self.cert.is_empty() || self.key.is_empty()
    }
}

/// Generate a self-signed CA certificate
pub fn generate_ca(common_name: &str) -> Result<CertKey> {
    let key = KeyPair::generate().map_err(|e| Error::PkiGenerate(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::PkiGenerate(e.to_string()))?;

    Ok(CertKey {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Issue a leaf certificate signed by `ca`.
///
/// Every host that parses as an IP address becomes an IP SAN, the rest
/// become DNS SANs.
pub fn generate_cert(common_name: &str, ca: &CertKey, hosts: &[&str]) -> Result<CertKey> {
    let ca_key = KeyPair::from_pem(&ca.key).map_err(|e| Error::PkiDecode(e.to_string()))?;
    let issuer_params = CertificateParams::from_ca_cert_pem(&ca.cert)
        .map_err(|e| Error::PkiDecode(e.to_string()))?;
    let issuer = issuer_params
        .self_signed(&ca_key)
        .map_err(|e| Error::PkiGenerate(e.to_string()))?;

    let ca_not_after = with_certificate(&ca.cert, |cert| {
        let ts = cert.validity().not_after.timestamp();
        OffsetDateTime::from_unix_timestamp(ts).map_err(|e| Error::PkiDecode(e.to_string()))
    })?;

    let leaf_key = generate_rsa_key()?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
    params.not_after = ca_not_after - Duration::hours(1);

    for host in hosts {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                (*host)
                    .try_into()
                    .map_err(|e: rcgen::Error| Error::PkiGenerate(e.to_string()))?,
            ),
        };
        params.subject_alt_names.push(san);
    }

    let cert = params
        .signed_by(&leaf_key, &issuer, &ca_key)
        .map_err(|e| Error::PkiGenerate(e.to_string()))?;

    Ok(CertKey {
        cert: cert.pem(),
        key: leaf_key.serialize_pem(),
    })
}

fn generate_rsa_key() -> Result<KeyPair> {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::PkiGenerate(e.to_string()))?;
    let pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::PkiGenerate(e.to_string()))?;
    KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Error::PkiGenerate(e.to_string()))
}

/// PEM encoded `(cert, key)` ready to be stored in a Secret
pub fn encode_cert_key(cert_key: &CertKey) -> (Vec<u8>, Vec<u8>) {
    (
        cert_key.cert.clone().into_bytes(),
        cert_key.key.clone().into_bytes(),
    )
}

/// Decode a PEM pair and prove the key belongs to the certificate
pub fn decode_cert_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertKey> {
    let cert = std::str::from_utf8(cert_pem)
        .map_err(|e| Error::PkiDecode(format!("certificate is not UTF-8: {e}")))?;
    let key = std::str::from_utf8(key_pem)
        .map_err(|e| Error::PkiDecode(format!("key is not UTF-8: {e}")))?;

    let key_pair = KeyPair::from_pem(key).map_err(|e| Error::PkiDecode(e.to_string()))?;
    let key_public = key_pair.public_key_raw().to_vec();

    with_certificate(cert, |parsed| {
        if parsed.public_key().subject_public_key.data.as_ref() != key_public.as_slice() {
            return Err(Error::PkiMismatch(
                "private key does not match certificate public key".to_string(),
            ));
        }
        Ok(())
    })?;

    Ok(CertKey {
        cert: cert.to_string(),
        key: key.to_string(),
    })
}

/// Parse a PEM certificate and return it unchanged on success
pub fn decode_certificate(cert_pem: &str) -> Result<String> {
    with_certificate(cert_pem, |_| Ok(()))?;
    Ok(cert_pem.to_string())
}

/// Verify `cert` against a CA chain.
///
/// The last element of `chain` is the root; preceding elements are
/// intermediates ordered from the leaf's issuer upwards.
pub fn validate_cert_with_ca_chain(cert: &str, chain: &[&str]) -> Result<()> {
    if chain.is_empty() {
        return Err(Error::PkiChain("empty CA chain".to_string()));
    }

    let mut pems = Vec::with_capacity(chain.len() + 1);
    pems.push(parse_pem(cert)?);
    for ca in chain {
        pems.push(parse_pem(ca)?);
    }

    let mut parsed = Vec::with_capacity(pems.len());
    for pem in &pems {
        parsed.push(
            pem.parse_x509()
                .map_err(|e| Error::PkiDecode(e.to_string()))?,
        );
    }

    for cert in &parsed {
        if !cert.validity().is_valid() {
            return Err(Error::PkiChain(format!(
                "certificate {} is outside its validity window",
                cert.subject()
            )));
        }
    }

    for pair in parsed.windows(2) {
        let (child, issuer) = (&pair[0], &pair[1]);
        if child.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(Error::PkiChain(format!(
                "{} is not issued by {}",
                child.subject(),
                issuer.subject()
            )));
        }
        child
            .verify_signature(Some(issuer.public_key()))
            .map_err(|e| Error::PkiChain(format!("{}: {e}", child.subject())))?;
    }

    for ca in parsed.iter().skip(1) {
        if !ca.is_ca() {
            return Err(Error::PkiChain(format!("{} is not a CA", ca.subject())));
        }
    }

    Ok(())
}

/// Check that `cert` is valid for `host` (an IP address or DNS name)
pub fn verify_hostname(cert: &str, host: &str) -> Result<()> {
    with_certificate(cert, |parsed| {
        let san = parsed
            .subject_alternative_name()
            .map_err(|e| Error::PkiDecode(e.to_string()))?;
        let names = san.map(|ext| ext.value.general_names.clone()).unwrap_or_default();

        let matched = match host.parse::<IpAddr>() {
            Ok(ip) => names.iter().any(|name| match name {
                GeneralName::IPAddress(raw) => ip_from_bytes(raw) == Some(ip),
                _ => false,
            }),
            Err(_) => names.iter().any(|name| match name {
                GeneralName::DNSName(dns) => dns.eq_ignore_ascii_case(host),
                _ => false,
            }),
        };

        if matched {
            Ok(())
        } else {
            Err(Error::PkiChain(format!(
                "certificate {} is not valid for host {host}",
                parsed.subject()
            )))
        }
    })
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

fn parse_pem(cert_pem: &str) -> Result<Pem> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::PkiDecode(format!("cannot decode PEM: {e}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(Error::PkiDecode(format!(
            "unexpected PEM block {}",
            pem.label
        )));
    }
    Ok(pem)
}

fn with_certificate<T>(
    cert_pem: &str,
    f: impl FnOnce(&X509Certificate<'_>) -> Result<T>,
) -> Result<T> {
    let pem = parse_pem(cert_pem)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::PkiDecode(format!("cannot parse certificate: {e}")))?;
    f(&cert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_leaf_chains_to_ca() {
        let ca = generate_ca("test-ca").unwrap();
        let leaf = generate_cert("leaf", &ca, &["127.0.0.1", "localhost"]).unwrap();

        validate_cert_with_ca_chain(&leaf.cert, &[&ca.cert]).unwrap();
        verify_hostname(&leaf.cert, "127.0.0.1").unwrap();
        verify_hostname(&leaf.cert, "LOCALHOST").unwrap();
        assert!(verify_hostname(&leaf.cert, "10.0.0.9").is_err());
    }

    #[test]
    fn leaf_expires_before_ca() {
        let ca = generate_ca("test-ca").unwrap();
        let leaf = generate_cert("leaf", &ca, &[]).unwrap();

        let ca_end = with_certificate(&ca.cert, |c| Ok(c.validity().not_after.timestamp())).unwrap();
        let leaf_end =
            with_certificate(&leaf.cert, |c| Ok(c.validity().not_after.timestamp())).unwrap();
        assert_eq!(ca_end - leaf_end, 3600);
    }

    #[test]
    fn foreign_ca_fails_chain() {
        let ca = generate_ca("ca-a").unwrap();
        let other = generate_ca("ca-b").unwrap();
        let leaf = generate_cert("leaf", &ca, &[]).unwrap();

        let err = validate_cert_with_ca_chain(&leaf.cert, &[&other.cert]).unwrap_err();
        assert!(matches!(err, Error::PkiChain(_)));
    }

    #[test]
    fn decode_roundtrip_and_mismatch() {
        let ca = generate_ca("ca").unwrap();
        let (cert, key) = encode_cert_key(&ca);
        assert_eq!(decode_cert_key(&cert, &key).unwrap(), ca);

        let other = generate_ca("other").unwrap();
        let err = decode_cert_key(ca.cert.as_bytes(), other.key.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::PkiMismatch(_)));
    }

    #[test]
    fn malformed_pem_is_decode_error() {
        let err = decode_certificate("-----BEGIN CERTIFICATE-----NOTB64-----END CERTIFICATE-----")
            .unwrap_err();
        assert!(matches!(err, Error::PkiDecode(_)));
    }
}
