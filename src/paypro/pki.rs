//! Payment request authentication
//!
//! Resolves the request's `pki_type` once into a [`PkiType`], then checks the
//! X.509 chain in `pki_data` up to a trusted root and the leaf's signature
//! over the request.

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::public_key::PublicKey as SpkiKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::message::{CodecError, PaymentRequest, ProtoMessage, X509Certificates};

/// Certificate and signature errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PkiError {
    #[error("Unsupported pki_type: {0}")]
    UnsupportedPkiType(String),
    #[error("Unsigned payment requests are not accepted")]
    UnsignedRequest,
    #[error("Payment request carries no certificates")]
    MissingCertificates,
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Unsupported merchant key type")]
    UnsupportedKeyType,
    #[error("Payment request signature is invalid")]
    InvalidSignature,
    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),
    #[error("Certificate expired or not yet valid: {0}")]
    ExpiredCertificate(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// How a payment request is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkiType {
    None,
    X509Sha1,
    X509Sha256,
}

impl PkiType {
    pub fn from_name(name: &str) -> Result<Self, PkiError> {
        match name {
            "none" => Ok(PkiType::None),
            "x509+sha1" => Ok(PkiType::X509Sha1),
            "x509+sha256" => Ok(PkiType::X509Sha256),
            other => Err(PkiError::UnsupportedPkiType(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PkiType::None => "none",
            PkiType::X509Sha1 => "x509+sha1",
            PkiType::X509Sha256 => "x509+sha256",
        }
    }

    /// Algorithm for the leaf signature over the request
    fn algorithm(
        self,
        spki: &SubjectPublicKeyInfo,
    ) -> Result<&'static dyn VerificationAlgorithm, PkiError> {
        let key = spki.parsed().map_err(|_| PkiError::UnsupportedKeyType)?;
        let point_len = spki.subject_public_key.data.len();

        match (self, key) {
            (PkiType::X509Sha256, SpkiKey::RSA(_)) => Ok(&signature::RSA_PKCS1_2048_8192_SHA256),
            (PkiType::X509Sha1, SpkiKey::RSA(_)) => {
                Ok(&signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY)
            }
            (PkiType::X509Sha256, SpkiKey::EC(_)) if point_len == 65 => {
                Ok(&signature::ECDSA_P256_SHA256_ASN1)
            }
            (PkiType::X509Sha256, SpkiKey::EC(_)) if point_len == 97 => {
                Ok(&signature::ECDSA_P384_SHA256_ASN1)
            }
            _ => Err(PkiError::UnsupportedKeyType),
        }
    }
}

/// Root certificates payment requests may chain to
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Vec<Vec<u8>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a DER root certificate
    pub fn add_der(&mut self, der: Vec<u8>) -> Result<(), PkiError> {
        parse_certificate(&der)?;
        self.roots.push(der);
        Ok(())
    }

    /// Add every certificate of a PEM bundle, returning how many were added
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<usize, PkiError> {
        let mut added = 0;
        for block in x509_parser::pem::Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
            self.add_der(block.contents)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMerchant {
    pub pki_type: PkiType,
    /// Subject common name of the signing certificate
    pub common_name: Option<String>,
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, PkiError> {
    let (rest, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
    if !rest.is_empty() {
        return Err(PkiError::InvalidCertificate(
            "trailing bytes after certificate".to_string(),
        ));
    }
    Ok(cert)
}

fn check_validity(cert: &X509Certificate<'_>, now: i64) -> Result<(), PkiError> {
    let validity = cert.validity();
    if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
        return Err(PkiError::ExpiredCertificate(cert.subject().to_string()));
    }
    Ok(())
}

fn is_issued_by(child: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> bool {
    child.issuer().as_raw() == issuer.subject().as_raw()
        && child.verify_signature(Some(issuer.public_key())).is_ok()
}

/// A certificate that signed another one must be a CA allowed to sign
/// certificates
fn check_issuer(cert: &X509Certificate<'_>) -> Result<(), PkiError> {
    let invalid = |e: x509_parser::error::X509Error| PkiError::InvalidCertificate(e.to_string());
    let is_ca = cert
        .basic_constraints()
        .map_err(invalid)?
        .map_or(false, |ext| ext.value.ca);
    let may_sign = cert
        .key_usage()
        .map_err(invalid)?
        .map_or(true, |ext| ext.value.key_cert_sign());
    if !is_ca || !may_sign {
        return Err(PkiError::UntrustedCertificate(format!(
            "{} is not a certificate authority",
            cert.subject()
        )));
    }
    Ok(())
}

/// Check the chain leaf-first up to a root in `trust`, all valid at `now`
fn verify_chain(
    chain: &[X509Certificate<'_>],
    trust: &TrustStore,
    now: i64,
) -> Result<(), PkiError> {
    for cert in chain {
        check_validity(cert, now)?;
    }

    for pair in chain.windows(2) {
        if !is_issued_by(&pair[0], &pair[1]) {
            return Err(PkiError::UntrustedCertificate(format!(
                "{} is not issued by {}",
                pair[0].subject(),
                pair[1].subject()
            )));
        }
        check_issuer(&pair[1])?;
    }

    let top = chain.last().ok_or(PkiError::MissingCertificates)?;
    for root_der in &trust.roots {
        let root = parse_certificate(root_der)?;
        if top.as_ref() == root.as_ref() {
            return Ok(());
        }
        if is_issued_by(top, &root) {
            check_issuer(&root)?;
            check_validity(&root, now)?;
            return Ok(());
        }
    }

    Err(PkiError::UntrustedCertificate(top.issuer().to_string()))
}

/// Authenticate a payment request at time `now` (seconds since the epoch)
pub fn verify_request(
    request: &PaymentRequest,
    trust: &TrustStore,
    now: i64,
    allow_unsigned: bool,
) -> Result<VerifiedMerchant, PkiError> {
    let pki_type = PkiType::from_name(request.pki_type_name())?;
    if pki_type == PkiType::None {
        if !allow_unsigned {
            return Err(PkiError::UnsignedRequest);
        }
        log::warn!("Accepting unsigned payment request");
        return Ok(VerifiedMerchant {
            pki_type,
            common_name: None,
        });
    }

    let pki_data = request
        .pki_data
        .as_deref()
        .ok_or(PkiError::MissingCertificates)?;
    let ders = X509Certificates::decode(pki_data)?.certificates;
    if ders.is_empty() {
        return Err(PkiError::MissingCertificates);
    }
    let chain = ders
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<Result<Vec<_>, _>>()?;

    verify_chain(&chain, trust, now)?;

    let leaf = &chain[0];
    let signature = request
        .signature
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(PkiError::InvalidSignature)?;
    let algorithm = pki_type.algorithm(leaf.public_key())?;
    let key_bytes: &[u8] = &leaf.public_key().subject_public_key.data;
    UnparsedPublicKey::new(algorithm, key_bytes)
        .verify(&request.signing_bytes(), signature)
        .map_err(|_| PkiError::InvalidSignature)?;

    let common_name = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    log::info!(
        "Payment request signed by {} ({})",
        common_name.as_deref().unwrap_or("unknown merchant"),
        pki_type.name()
    );
    Ok(VerifiedMerchant {
        pki_type,
        common_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{signed_request, MerchantPki};

    const NOW: i64 = 1_750_000_000;

    #[test]
    fn test_pki_type_names() {
        assert_eq!(PkiType::from_name("x509+sha256").unwrap(), PkiType::X509Sha256);
        assert_eq!(PkiType::from_name("x509+sha1").unwrap(), PkiType::X509Sha1);
        assert_eq!(
            PkiType::from_name("pgp+sha2"),
            Err(PkiError::UnsupportedPkiType("pgp+sha2".to_string()))
        );
    }

    #[test]
    fn test_valid_signed_request() {
        let pki = MerchantPki::new();
        let request = signed_request(&pki, b"details".to_vec());

        let merchant = verify_request(&request, &pki.trust_store(), NOW, false).unwrap();
        assert_eq!(merchant.pki_type, PkiType::X509Sha256);
        assert_eq!(merchant.common_name.as_deref(), Some("merchant.example"));
    }

    #[test]
    fn test_tampered_signature() {
        let pki = MerchantPki::new();
        let mut request = signed_request(&pki, b"details".to_vec());
        if let Some(sig) = request.signature.as_mut() {
            let last = sig.len() - 1;
            sig[last] ^= 0x01;
        }

        assert_eq!(
            verify_request(&request, &pki.trust_store(), NOW, false),
            Err(PkiError::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_details() {
        let pki = MerchantPki::new();
        let mut request = signed_request(&pki, b"details".to_vec());
        request.serialized_payment_details = b"other details".to_vec();

        assert_eq!(
            verify_request(&request, &pki.trust_store(), NOW, false),
            Err(PkiError::InvalidSignature)
        );
    }

    #[test]
    fn test_untrusted_root() {
        let pki = MerchantPki::new();
        let stranger = MerchantPki::new();
        let request = signed_request(&pki, b"details".to_vec());

        assert!(matches!(
            verify_request(&request, &stranger.trust_store(), NOW, false),
            Err(PkiError::UntrustedCertificate(_))
        ));
        assert!(matches!(
            verify_request(&request, &TrustStore::new(), NOW, false),
            Err(PkiError::UntrustedCertificate(_))
        ));
    }

    #[test]
    fn test_end_entity_cannot_issue() {
        let pki = MerchantPki::issued_by_merchant();
        let request = signed_request(&pki, b"details".to_vec());

        match verify_request(&request, &pki.trust_store(), NOW, false) {
            Err(PkiError::UntrustedCertificate(reason)) => {
                assert!(reason.contains("merchant.example"), "{}", reason);
            }
            other => panic!("expected UntrustedCertificate, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_certificate() {
        let pki = MerchantPki::expired();
        let request = signed_request(&pki, b"details".to_vec());

        assert!(matches!(
            verify_request(&request, &pki.trust_store(), NOW, false),
            Err(PkiError::ExpiredCertificate(_))
        ));
    }

    #[test]
    fn test_unsigned_policy() {
        let request = PaymentRequest {
            serialized_payment_details: b"details".to_vec(),
            ..Default::default()
        };
        assert_eq!(
            verify_request(&request, &TrustStore::new(), NOW, false),
            Err(PkiError::UnsignedRequest)
        );
        assert_eq!(
            verify_request(&request, &TrustStore::new(), NOW, true)
                .unwrap()
                .pki_type,
            PkiType::None
        );
    }

    #[test]
    fn test_missing_certificates() {
        let request = PaymentRequest {
            pki_type: Some("x509+sha256".to_string()),
            pki_data: Some(X509Certificates::default().encode()),
            serialized_payment_details: b"details".to_vec(),
            signature: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(
            verify_request(&request, &TrustStore::new(), NOW, false),
            Err(PkiError::MissingCertificates)
        );
    }

    #[test]
    fn test_trust_store_rejects_garbage() {
        let mut trust = TrustStore::new();
        assert!(matches!(
            trust.add_der(vec![0x30, 0x03, 0x01, 0x01, 0x00]),
            Err(PkiError::InvalidCertificate(_))
        ));
        assert!(trust.is_empty());
    }

    #[test]
    fn test_trust_store_from_pem() {
        let pki = MerchantPki::new();
        let mut trust = TrustStore::new();
        assert_eq!(trust.add_pem(pki.root_pem().as_bytes()).unwrap(), 1);
        assert_eq!(trust.len(), 1);
    }
}
