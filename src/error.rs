//! Errors surfaced by [`crate::issue_or_renew`].

use std::collections::BTreeSet;

use thiserror::Error;

use crate::cert::CsrError;
use crate::dns::ProviderError;
use crate::key::KeyError;
use crate::protocol::AcmeError;
use crate::service::account::AccountError;
use crate::service::order::FinalizeError;
use crate::service::BuilderError;
use crate::store::StoreError;

/// Why an issuance or renewal failed.
///
/// Transient network failures and `badNonce` responses are retried inside
/// the ACME client and only appear here once retries are exhausted.
#[derive(Debug, Error)]
pub enum IssueError {
    /// The ACME provider rejected a request with a problem document.
    #[error("ACME provider rejected the request ({kind}): {detail}")]
    AcmeProtocol {
        /// The problem `type`, usually an ACME error URN.
        kind: String,
        /// The provider's `detail`, verbatim.
        detail: String,
        /// HTTP status the problem was delivered with.
        status: Option<u16>,
    },

    /// The DNS provider failed after bounded retries.
    #[error("DNS provider error: {0}")]
    Provider(#[from] ProviderError),

    /// An authorization did not reach a final state in time.
    #[error("timed out waiting for validation of {domain}")]
    ValidationTimeout {
        /// The domain being validated.
        domain: String,
    },

    /// An authorization became invalid, failing the whole order.
    #[error("authorization for {domain} is invalid: {detail}")]
    AuthorizationInvalid {
        /// The domain that failed validation.
        domain: String,
        /// The challenge error detail from the ACME provider.
        detail: String,
    },

    /// The order became invalid.
    #[error("order is invalid: {detail}")]
    OrderInvalid {
        /// The order error detail from the ACME provider.
        detail: String,
    },

    /// The order did not complete within the overall timeout.
    #[error("timed out waiting for the order to complete")]
    OrderTimeout,

    /// The caller cancelled the issuance.
    #[error("issuance was cancelled")]
    Cancelled,

    /// The CSR does not name exactly the order's identifiers.
    #[error("CSR names {found:?} do not match requested names {expected:?}")]
    CsrMismatch {
        /// Names in the order.
        expected: BTreeSet<String>,
        /// Names in the CSR.
        found: BTreeSet<String>,
    },

    /// The issued certificate does not name exactly the requested names.
    #[error("issued certificate names {found:?} do not match requested names {expected:?}")]
    CertificateMismatch {
        /// Names in the order.
        expected: BTreeSet<String>,
        /// Names in the issued leaf certificate.
        found: BTreeSet<String>,
    },

    /// The provider did not offer a `dns-01` challenge for a domain.
    #[error("no dns-01 challenge offered for {domain}")]
    UnsupportedChallenge {
        /// The domain without a `dns-01` challenge.
        domain: String,
    },

    /// No domains were requested.
    #[error("no domains requested")]
    NoDomains,

    /// The certificate request could not be built or signed.
    #[error("certificate request: {0}")]
    Signing(#[from] CsrError),

    /// The ACME account could not be used.
    #[error(transparent)]
    Account(#[from] AccountError),

    /// A key could not be generated, loaded or saved.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The certificate could not be stored or read back.
    #[error("certificate store: {0}")]
    Store(#[from] StoreError),

    /// The ACME directory could not be loaded.
    #[error(transparent)]
    Directory(#[from] BuilderError),

    /// Transport or encoding failure talking to the ACME provider.
    #[error(transparent)]
    Transport(AcmeError),
}

impl From<AcmeError> for IssueError {
    fn from(error: AcmeError) -> Self {
        match error {
            AcmeError::Acme(document) => IssueError::AcmeProtocol {
                kind: document.kind().to_owned(),
                detail: document.message().to_owned(),
                status: document.status().map(|status| status.as_u16()),
            },
            error => IssueError::Transport(error),
        }
    }
}

impl From<FinalizeError> for IssueError {
    fn from(error: FinalizeError) -> Self {
        match error {
            FinalizeError::CsrMismatch { expected, found } => {
                IssueError::CsrMismatch { expected, found }
            }
            FinalizeError::Csr(error) => IssueError::Signing(error),
            FinalizeError::OrderInvalid { detail } => IssueError::OrderInvalid { detail },
            FinalizeError::Protocol(error) => error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::errors::AcmeErrorDocument;

    #[test]
    fn problem_document_becomes_protocol_error() {
        let document: AcmeErrorDocument =
            serde_json::from_str(crate::example!("error-rate-limited.json")).unwrap();

        let error = IssueError::from(AcmeError::Acme(document));
        match &error {
            IssueError::AcmeProtocol { kind, status, .. } => {
                assert_eq!(kind, "urn:ietf:params:acme:error:rateLimited");
                assert_eq!(*status, Some(429));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(error.to_string().contains("rateLimited"));
    }

    #[test]
    fn invalid_authorization_names_domain() {
        let error = IssueError::AuthorizationInvalid {
            domain: "*.example.com".into(),
            detail: "No TXT record found".into(),
        };
        let message = error.to_string();
        assert!(message.contains("*.example.com"));
        assert!(message.contains("No TXT record found"));
    }
}
