//! Cryptographic primitives for X.509 certificate signing requests and issued certificates.
//!
//! The certificate key is always ECDSA P-256 and is distinct from the account key.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use const_oid::db::rfc5280::ID_CE_SUBJECT_ALT_NAME;
use der::{
    asn1::{Ia5StringRef, SetOfVec},
    Decode, Encode, FixedTag,
};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs8::der::zeroize::Zeroizing;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use signature::Signer;
use thiserror::Error;
use x509_cert::ext::pkix::{self, name::GeneralName, SubjectAltName};
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::spki::{
    DynSignatureAlgorithmIdentifier, SignatureBitStringEncoding, SubjectPublicKeyInfoOwned,
};

const PEM_TAG_CSR: &str = "CERTIFICATE REQUEST";

/// Errors building or inspecting CSRs and certificates.
#[derive(Debug, Error)]
pub enum CsrError {
    /// A name could not be encoded as an IA5 DNS name.
    #[error("{0:?} is not a valid DNS name")]
    InvalidName(String),

    /// The request contains no names.
    #[error("certificate request has no names")]
    Empty,

    /// ASN.1 encoding or decoding failed.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// The public key could not be encoded.
    #[error("public key encoding error: {0}")]
    Spki(#[from] x509_cert::spki::Error),

    /// The certificate key failed to sign.
    #[error("signature error: {0}")]
    Signing(#[from] signature::Error),

    /// The certificate key could not be read or written.
    #[error("certificate key error: {0}")]
    Key(#[from] pkcs8::Error),

    /// A PEM document could not be produced or parsed.
    #[error("PEM error: {0}")]
    Pem(#[from] pem_rfc7468::Error),
}

/// ECDSA P-256 private key for the issued certificate.
///
/// The certificate key is used once, to sign the CSR, and is then
/// written to `privkey.pem` next to the certificate.
pub struct CertificateKey(p256::ecdsa::SigningKey);

impl CertificateKey {
    /// Generate a fresh key.
    pub fn random() -> Self {
        CertificateKey(p256::ecdsa::SigningKey::random(&mut OsRng))
    }

    /// Read a key from PKCS#8 (`PRIVATE KEY`) or SEC1 (`EC PRIVATE KEY`) PEM.
    pub fn from_pem(data: &str) -> Result<Self, CsrError> {
        let label = pem_rfc7468::decode_label(data.trim().as_bytes())?;
        if label == "EC PRIVATE KEY" {
            let secret =
                p256::SecretKey::from_sec1_pem(data).map_err(|_| pkcs8::Error::KeyMalformed)?;
            return Ok(CertificateKey(p256::ecdsa::SigningKey::from(&secret)));
        }
        Ok(CertificateKey(p256::ecdsa::SigningKey::from_pkcs8_pem(
            data,
        )?))
    }

    /// Read a key from a PEM file, returning `None` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, CsrError> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Self::from_pem(&data).map(Some),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                tracing::warn!(path = %path.display(), "Unable to read certificate key: {error}");
                Ok(None)
            }
        }
    }

    /// Encode this key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CsrError> {
        Ok(self.0.to_pkcs8_pem(LineEnding::LF)?)
    }

    /// Whether this key is the private half of the certificate's public key.
    pub fn matches(&self, certificate: &x509_cert::Certificate) -> bool {
        let point = p256::PublicKey::from(self.0.verifying_key()).to_encoded_point(false);
        certificate
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes()
            == point.as_bytes()
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateKey(P-256)")
    }
}

/// Name to be certified by the certificate issued from this request.
///
/// Currently, only DNS names are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedSubjectName {
    /// A name known to the Domain Name System, such as `www.example.com`
    Dns(String),
}

impl fmt::Display for RequestedSubjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RequestedSubjectName::Dns(dns) => write!(f, "DNS:{}", dns),
        }
    }
}

impl From<String> for RequestedSubjectName {
    fn from(value: String) -> Self {
        RequestedSubjectName::Dns(value)
    }
}

impl From<&str> for RequestedSubjectName {
    fn from(value: &str) -> Self {
        Self::Dns(value.to_owned())
    }
}

/// The informational data in a certificate signing request sufficient to
/// fulfill an ACME order's finalize step.
///
/// All names are carried in the "SubjectAltNames" extension, and the subject
/// is left empty, which is acceptable for ACME CSRs.
#[derive(Debug, Default)]
pub struct CertificateSigningRequest {
    names: Vec<RequestedSubjectName>,
}

impl CertificateSigningRequest {
    /// Create a new, empty ceritficate signing request.
    pub fn new() -> Self {
        CertificateSigningRequest { names: Vec::new() }
    }

    /// Number of names in this CSR
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// CSR contains no names
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Add a subject name to this certificate signing request
    pub fn push<N>(&mut self, name: N)
    where
        N: Into<RequestedSubjectName>,
    {
        self.names.push(name.into())
    }

    /// Sign this request with the certificate key, producing a DER encoded
    /// PKCS#10 request.
    pub fn sign(self, key: &CertificateKey) -> Result<SignedCertificateRequest, CsrError> {
        if self.names.is_empty() {
            return Err(CsrError::Empty);
        }

        let public_key = key.0.verifying_key().to_public_key_der()?;
        let spki = SubjectPublicKeyInfoOwned::from_der(public_key.as_bytes())?;

        let san_names = self
            .names
            .iter()
            .map(|san| match san {
                RequestedSubjectName::Dns(dns) => Ia5StringRef::new(dns.as_bytes())
                    .map(|name| GeneralName::DnsName(name.into()))
                    .map_err(|_| CsrError::InvalidName(dns.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let san = pkix::SubjectAltName::from(san_names);
        let name: x509_cert::name::Name = Default::default();
        let extension = san.to_extension(&name, &[])?;

        // extensionRequest holds a SEQUENCE OF Extension.
        let encoded_extensions = der::asn1::Any::new(Extension::TAG, extension.to_der()?)?;

        let mut values = SetOfVec::new();
        values.insert(encoded_extensions)?;

        let attr = x509_cert::attr::Attribute {
            oid: const_oid::db::rfc5912::ID_EXTENSION_REQ,
            values,
        };

        let mut attributes = SetOfVec::new();
        attributes.insert(attr)?;

        let csr_info = x509_cert::request::CertReqInfo {
            version: x509_cert::request::Version::V1,
            subject: Default::default(),
            public_key: spki,
            attributes,
        };

        let csr_target = csr_info.to_der()?;
        let signature: ecdsa::der::Signature<p256::NistP256> = key.0.try_sign(&csr_target)?;

        let csr = x509_cert::request::CertReq {
            info: csr_info,
            algorithm: key.0.signature_algorithm_identifier()?,
            signature: signature.to_bitstring()?,
        };

        Ok(SignedCertificateRequest(csr.to_der()?.into_boxed_slice()))
    }
}

/// A certificate request, cryptographcially signed, and encoded as ASN.1 DER
#[derive(Debug, Clone)]
pub struct SignedCertificateRequest(Box<[u8]>);

impl SignedCertificateRequest {
    /// Encode this CSR as a PEM document.
    pub fn to_pem(&self) -> Result<String, CsrError> {
        Ok(pem_rfc7468::encode_string(
            PEM_TAG_CSR,
            base64ct::LineEnding::LF,
            &self.0,
        )?)
    }

    /// The DNS names requested in the SubjectAltName extension of this CSR.
    pub fn subject_names(&self) -> Result<BTreeSet<String>, CsrError> {
        let request = x509_cert::request::CertReq::from_der(&self.0)?;
        let mut names = BTreeSet::new();
        for attr in request.info.attributes.iter() {
            if attr.oid != const_oid::db::rfc5912::ID_EXTENSION_REQ {
                continue;
            }
            for value in attr.values.iter() {
                let extensions: Vec<Extension> = value.decode_as()?;
                names.extend(san_names(&extensions)?);
            }
        }
        Ok(names)
    }
}

impl From<Vec<u8>> for SignedCertificateRequest {
    fn from(value: Vec<u8>) -> Self {
        SignedCertificateRequest(value.into_boxed_slice())
    }
}

impl AsRef<[u8]> for SignedCertificateRequest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn san_names(extensions: &[Extension]) -> Result<BTreeSet<String>, der::Error> {
    let mut names = BTreeSet::new();
    for extension in extensions
        .iter()
        .filter(|ext| ext.extn_id == ID_CE_SUBJECT_ALT_NAME)
    {
        let san = SubjectAltName::from_der(extension.extn_value.as_bytes())?;
        for name in san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.insert(dns.to_string());
            }
        }
    }
    Ok(names)
}

/// The DNS names in an issued certificate's SubjectAltName extension.
pub fn certificate_names(
    certificate: &x509_cert::Certificate,
) -> Result<BTreeSet<String>, der::Error> {
    match &certificate.tbs_certificate.extensions {
        Some(extensions) => san_names(extensions),
        None => Ok(BTreeSet::new()),
    }
}

/// The `(notBefore, notAfter)` validity window of a certificate.
pub fn certificate_validity(
    certificate: &x509_cert::Certificate,
) -> Result<(DateTime<Utc>, DateTime<Utc>), der::Error> {
    let validity = &certificate.tbs_certificate.validity;
    let convert = |time: &x509_cert::time::Time| {
        let since_epoch = time.to_unix_duration();
        DateTime::from_timestamp(since_epoch.as_secs() as i64, 0)
            .ok_or_else(|| der::Error::from(der::ErrorKind::DateTime))
    };
    Ok((convert(&validity.not_before)?, convert(&validity.not_after)?))
}
