//! # Certificate orders
//!
//! Each order corresponds to a single request for a certificate chain, but may
//! include multiple identifiers.  The order is created by the client, and then validated
//! using the authorizations and challenges.

use chrono::{DateTime, Utc};
use der::Decode as _;
use pem_rfc7468::PemLabel;
use serde::{Deserialize, Serialize};

use super::identifier::Identifier;
use crate::cert::SignedCertificateRequest;
use crate::protocol::errors::AcmeError;
use crate::protocol::errors::AcmeErrorDocument;
use crate::protocol::Base64Data;
use crate::protocol::Url;

const PEM_DOCUMENT_BEGIN: &str = "-----BEGIN";

/// An ACME order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    status: OrderStatus,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
    identifiers: Vec<Identifier>,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    error: Option<AcmeErrorDocument>,
    authorizations: Vec<Url>,
    finalize: Url,
    #[serde(default)]
    certificate: Option<Url>,
}

impl Order {
    /// The status of the order.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// The time at which the order expires, and the provider will
    /// no longer consider it valid.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// The identifiers which apply to this order.
    pub fn identifiers(&self) -> &[Identifier] {
        self.identifiers.as_ref()
    }

    /// The configured start time for the certificate.
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// The configured end time for the certificate.
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    /// The error, if any, which occurred while processing the order.
    pub fn error(&self) -> Option<&AcmeErrorDocument> {
        self.error.as_ref()
    }

    /// The urls pointing to the Authorization objects for this order.
    pub fn authorizations(&self) -> &[Url] {
        self.authorizations.as_ref()
    }

    /// The URL used to finalize this order with a CSR.
    pub fn finalize(&self) -> &Url {
        &self.finalize
    }

    /// The URL used to fetch this order's certificate chain.
    ///
    /// Only meaningful once the order is [`OrderStatus::Valid`].
    pub fn certificate(&self) -> Option<&Url> {
        match self.status {
            OrderStatus::Valid => self.certificate.as_ref(),
            _ => None,
        }
    }
}

/// State of the order during processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Order is waiting for authorizations to be completed.
    Pending,
    /// Order is ready for a certificate signing request.
    Ready,

    /// ACME provider is processing the certificate signing request.
    Processing,

    /// ACME provider has issued the certificate.
    Valid,

    /// ACME provider has encountered an error while processing the order, and the entire
    /// order is now considered invalid.
    Invalid,
}

/// A request to create a new order associated with an ACME account.
///
/// The associated account is specified by the key used to sign the JWT request.
#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    /// A list of identifiers to include in the order.
    pub identifiers: Vec<Identifier>,

    /// Sets a time before which the issued certificate will not be valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Sets a time after which the issued certificate will not be valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

/// The request sent to finalize an order, including the certificate signing request.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeOrder {
    csr: Base64Data<SignedCertificateRequest>,
}

impl From<SignedCertificateRequest> for FinalizeOrder {
    fn from(value: SignedCertificateRequest) -> Self {
        FinalizeOrder { csr: value.into() }
    }
}

/// A chain of certificates, returned when an order is successful.
///
/// The first certificate is the leaf; the rest are intermediates, in
/// the order the provider returned them. Each block is re-encoded as
/// canonical PEM so that `fullchain == leaf + chain` byte for byte.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    leaf: x509_cert::Certificate,
    leaf_pem: String,
    chain_pem: String,
}

impl CertificateChain {
    /// Split a PEM bundle on certificate boundaries.
    pub fn from_pem(text: &str) -> Result<Self, AcmeError> {
        let mut documents = text
            .split(PEM_DOCUMENT_BEGIN)
            .filter(|doc| !doc.trim().is_empty())
            .map(|part| {
                let doc = format!("{PEM_DOCUMENT_BEGIN}{part}");
                let (label, data) = pem_rfc7468::decode_vec(doc.trim().as_bytes())?;
                if label != x509_cert::Certificate::PEM_LABEL {
                    return Err(AcmeError::from(pem_rfc7468::Error::Label));
                }
                let certificate = x509_cert::Certificate::from_der(&data)?;
                let pem = pem_rfc7468::encode_string(
                    x509_cert::Certificate::PEM_LABEL,
                    base64ct::LineEnding::LF,
                    &data,
                )?;
                Ok((certificate, pem))
            });

        let (leaf, leaf_pem) = documents
            .next()
            .ok_or(AcmeError::MissingData("certificate chain is empty"))??;
        let chain_pem = documents
            .map(|doc| doc.map(|(_, pem)| pem))
            .collect::<Result<String, AcmeError>>()?;

        Ok(CertificateChain {
            leaf,
            leaf_pem,
            chain_pem,
        })
    }

    /// The parsed leaf certificate.
    pub fn leaf(&self) -> &x509_cert::Certificate {
        &self.leaf
    }

    /// The leaf certificate as PEM.
    pub fn leaf_pem(&self) -> &str {
        &self.leaf_pem
    }

    /// The intermediate certificates as concatenated PEM.
    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// The leaf followed by the intermediates.
    pub fn fullchain_pem(&self) -> String {
        format!("{}{}", self.leaf_pem, self.chain_pem)
    }
}

impl crate::protocol::response::Decode for CertificateChain {
    fn decode(data: &[u8]) -> Result<Self, AcmeError> {
        let text = std::str::from_utf8(data)?;
        CertificateChain::from_pem(text).inspect_err(|err| {
            tracing::error!("Error {err} decoding certificate chain");
        })
    }
}
