//! Credential materials: private key, CSR and certificate chain.
//!
//! A credential set is only ever constructed through validation: the key
//! must parse as the configured algorithm, the chain must be non-empty and
//! linked leaf first, its leaf must carry the key's public key and exactly
//! the managed names, and no entry may be expired.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use rcgen::{
    CertificateParams, DistinguishedName, KeyPair, PublicKeyData, SignatureAlgorithm,
    PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::error::DriveError;
use crate::resources::normalized;

const PEM_CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Key algorithm for certificate keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySpec {
    #[default]
    P256,
    P384,
}

impl KeySpec {
    pub fn algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeySpec::P256 => &PKCS_ECDSA_P256_SHA256,
            KeySpec::P384 => &PKCS_ECDSA_P384_SHA384,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeySpec::P256 => "p256",
            KeySpec::P384 => "p384",
        }
    }
}

/// Source of fresh certificate keys
pub trait KeySource: Send + Sync {
    fn generate(&self, spec: KeySpec) -> Result<KeyPair, DriveError>;
}

/// Generates a new key in process for every call
#[derive(Debug, Default, Clone, Copy)]
pub struct FreshKeys;

impl KeySource for FreshKeys {
    fn generate(&self, spec: KeySpec) -> Result<KeyPair, DriveError> {
        KeyPair::generate_for(spec.algorithm())
            .map_err(|e| DriveError::Validation(format!("failed to generate {} key: {e}", spec.as_str())))
    }
}

/// PEM encoded certificate private key
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    spec: KeySpec,
    pem: String,
}

impl PrivateKey {
    pub fn from_pem(spec: KeySpec, pem: impl Into<String>) -> Self {
        Self {
            spec,
            pem: pem.into(),
        }
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Parse the key, failing unless it is a key of the expected algorithm
    fn key_pair(&self) -> Result<KeyPair, DriveError> {
        KeyPair::from_pem_and_sign_algo(&self.pem, self.spec.algorithm()).map_err(|e| {
            DriveError::Validation(format!("private key is not a valid {} key: {e}", self.spec.as_str()))
        })
    }

    /// DER SubjectPublicKeyInfo of this key
    pub fn public_key_info(&self) -> Result<Vec<u8>, DriveError> {
        Ok(self.key_pair()?.subject_public_key_info())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("spec", &self.spec)
            .field("pem", &"<redacted>")
            .finish()
    }
}

/// A fresh key and the certificate request built from it
///
/// Generated once per drive cycle; the key here is the key later paired
/// with the issued certificate.
pub struct CsrMaterial {
    key: PrivateKey,
    der: Vec<u8>,
    names: Vec<String>,
    public_key_info: Vec<u8>,
}

impl CsrMaterial {
    /// Generate a new key and a CSR over `names`, in SAN order
    pub fn generate(
        keys: &dyn KeySource,
        spec: KeySpec,
        names: &[String],
    ) -> Result<Self, DriveError> {
        if names.is_empty() {
            return Err(DriveError::Validation("CSR needs at least one name".into()));
        }
        let key_pair = keys.generate(spec)?;

        let mut params = CertificateParams::new(names.to_vec())
            .map_err(|e| DriveError::Validation(format!("invalid CSR names: {e}")))?;
        params.distinguished_name = DistinguishedName::new();

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| DriveError::Validation(format!("failed to create CSR: {e}")))?;
        let der = csr.der().to_vec();
        let public_key_info = key_pair.subject_public_key_info();

        debug!(names = ?names, key_spec = spec.as_str(), "Generated key and CSR");

        Ok(Self {
            key: PrivateKey::from_pem(spec, key_pair.serialize_pem()),
            der,
            names: names.to_vec(),
            public_key_info,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// base64url encoding of the CSR, as carried in a finalize request
    pub fn der_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.der)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn public_key_info(&self) -> &[u8] {
        &self.public_key_info
    }

    pub fn into_key(self) -> PrivateKey {
        self.key
    }
}

impl fmt::Debug for CsrMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrMaterial")
            .field("names", &self.names)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Owned facts extracted from one DER certificate
#[derive(Debug, Clone)]
pub struct CertificateSummary {
    pub subject: Vec<u8>,
    pub issuer: Vec<u8>,
    pub public_key_info: Vec<u8>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, DriveError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| DriveError::Validation(format!("invalid X.509 certificate: {e}")))
}

impl CertificateSummary {
    pub fn parse(der: &[u8]) -> Result<Self, DriveError> {
        Self::from_certificate(&parse_certificate(der)?)
    }

    fn from_certificate(cert: &X509Certificate<'_>) -> Result<Self, DriveError> {
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| DriveError::Validation("certificate expiry out of range".into()))?;

        let mut dns_names = Vec::new();
        let san = cert
            .tbs_certificate
            .subject_alternative_name()
            .map_err(|e| DriveError::Validation(format!("bad subjectAltName: {e}")))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(dns.to_string());
                }
            }
        }

        Ok(Self {
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
            public_key_info: cert.public_key().raw.to_vec(),
            not_after,
            dns_names,
        })
    }
}

/// Ordered certificate chain, leaf first, DER encoded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self { certs }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.certs.first().map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.certs.iter().map(Vec::as_slice)
    }

    pub(crate) fn push(&mut self, der: Vec<u8>) {
        self.certs.push(der);
    }

    /// Parse every `CERTIFICATE` block of a PEM bundle, in order
    pub fn from_pem(bundle: &str) -> Result<Self, DriveError> {
        let blocks = pem::parse_many(bundle)
            .map_err(|e| DriveError::Validation(format!("invalid PEM: {e}")))?;
        let certs = blocks
            .into_iter()
            .filter(|block| block.tag() == PEM_CERTIFICATE_LABEL)
            .map(Pem::into_contents)
            .collect();
        Ok(Self { certs })
    }

    /// PEM bundle of the chain, leaf first, LF line endings
    pub fn to_pem(&self) -> String {
        let blocks: Vec<Pem> = self
            .certs
            .iter()
            .map(|der| Pem::new(PEM_CERTIFICATE_LABEL, der.clone()))
            .collect();
        pem::encode_many_config(&blocks, EncodeConfig::new().set_line_ending(LineEnding::LF))
    }

    /// Check that each entry was issued and signed by the entry after it
    ///
    /// An entry's issuer name must equal the next entry's subject, and its
    /// signature must verify under the next entry's public key.
    pub fn verify_linkage(&self) -> Result<Vec<CertificateSummary>, DriveError> {
        let parsed = self
            .certs
            .iter()
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<_>, _>>()?;

        for (idx, pair) in parsed.windows(2).enumerate() {
            let (cert, issuer) = (&pair[0], &pair[1]);
            if cert.issuer().as_raw() != issuer.subject().as_raw() {
                return Err(DriveError::Validation(format!(
                    "chain entry {} is not issued by entry {}",
                    idx,
                    idx + 1
                )));
            }
            cert.verify_signature(Some(issuer.public_key())).map_err(|e| {
                DriveError::Validation(format!(
                    "chain entry {} signature does not verify against entry {}: {e}",
                    idx,
                    idx + 1
                ))
            })?;
        }

        parsed.iter().map(CertificateSummary::from_certificate).collect()
    }
}

/// A validated key and certificate chain ready for installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    key: PrivateKey,
    chain: CertificateChain,
    names: Vec<String>,
    not_after: DateTime<Utc>,
}

impl Credentials {
    /// Validate and pair `key` with `chain`
    ///
    /// `names` is the exact name set the leaf must carry; `now` is the
    /// instant no chain entry may be expired at.
    pub fn new(
        key: PrivateKey,
        chain: CertificateChain,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Self, DriveError> {
        let key_info = key.public_key_info()?;

        if chain.is_empty() {
            return Err(DriveError::Validation("certificate chain is empty".into()));
        }
        let summaries = chain.verify_linkage()?;
        let leaf = &summaries[0];

        if leaf.public_key_info != key_info {
            return Err(DriveError::Validation(
                "leaf certificate does not match the private key".into(),
            ));
        }

        for (idx, summary) in summaries.iter().enumerate() {
            if summary.not_after <= now {
                return Err(DriveError::Validation(format!(
                    "chain entry {} expired at {}",
                    idx, summary.not_after
                )));
            }
        }

        if normalized(&leaf.dns_names) != normalized(names) {
            return Err(DriveError::Validation(format!(
                "leaf names {:?} do not match {:?}",
                leaf.dns_names, names
            )));
        }

        trace!(
            chain_len = chain.len(),
            not_after = %leaf.not_after,
            "Credentials validated"
        );

        Ok(Self {
            key,
            names: leaf.dns_names.clone(),
            not_after: leaf.not_after,
            chain,
        })
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    /// DNS names on the leaf certificate
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}
