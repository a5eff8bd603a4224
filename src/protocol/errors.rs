//! Errors which occur when working with an ACME Protocol

use http::HeaderValue;
use thiserror::Error;

pub use self::acme::{AcmeErrorCode, AcmeErrorDocument};

/// Unified error type for errors arising from the ACME protocol.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The ACME provider returned an error, see [`AcmeErrorDocument`].
    #[error("An error occured with the ACME service: {0}")]
    Acme(#[source] self::acme::AcmeErrorDocument),

    /// The `reqwest` library encountered an error while fulfilling the HTTP
    /// request, and the ACME provider did not provide a corresponding error document.
    #[error("An error occured during the network request: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The ACME provider returned an unsuccessful status without a parseable
    /// problem document.
    #[error("The ACME service returned HTTP {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: http::StatusCode,
        /// The response body, decoded lossily.
        body: String,
    },

    /// An error was encountered while trying to deserialize the JSON payload of the response.
    #[error("An error occured deserializing JSON: {0}")]
    JsonDeserialize(#[source] serde_json::Error),

    /// An error was encountered while trying to serialize the JSON payload of the request.
    #[error("An error occured serializing JSON: {0}")]
    JsonSerialize(#[source] serde_json::Error),

    /// An error occured while trying decode a PEM binary in a response.
    #[error("An error occured while deserializing a PEM document: {0}")]
    PemDecodeError(#[from] pem_rfc7468::Error),

    /// An error occured while trying decode a DER binary in a response.
    #[error("An error occured while deserializing a DER binary: {0}")]
    DerDecodeError(#[from] der::Error),

    /// The ACME Client encountered non utf-8 data in a response.
    #[error("The ACME Client encountered non utf-8 data: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    /// The nonce header returned was not valid text.
    #[error("The nonce header returned was not valid: {0:?}")]
    InvalidNonce(Option<HeaderValue>),

    /// The ACME provider did not provide a nonce. This is a bug in the provider's
    /// adherence to [RFC 8555](https://tools.ietf.org/html/rfc8555).
    #[error("No Nonce header was returned with the request")]
    MissingNonce,

    /// The `reqwest` library encountered an error while making an additional HTTP
    /// request to get a new nonce.
    #[error("An error occured during a network request to fetch a new nonce: {0}")]
    NonceRequest(#[source] reqwest::Error),

    /// The signing algorithm encountered an error.
    #[error("An error occured while signing the JWS token: {0}")]
    Signing(#[source] signature::Error),

    /// Some data was missing from an input or a response.
    #[error("Required data is missing: {0}")]
    MissingData(&'static str),

    /// The ACME provider indicated that a resource is not ready.
    #[error("{0} is not ready")]
    NotReady(&'static str),
}

impl AcmeError {
    /// Constructor for a deserialization error.
    pub fn de(error: serde_json::Error) -> Self {
        AcmeError::JsonDeserialize(error)
    }

    /// Constructor for a serialization error.
    pub fn ser(error: serde_json::Error) -> Self {
        AcmeError::JsonSerialize(error)
    }

    /// Constructor for a Nonce request error.
    pub fn nonce(error: reqwest::Error) -> Self {
        AcmeError::NonceRequest(error)
    }

    /// Whether this error is transient, and the request should be
    /// retried after a backoff.
    ///
    /// Connection failures, timeouts and server-side (5xx) errors are transient.
    /// Problem documents for client errors (4xx) never are.
    pub fn is_transient(&self) -> bool {
        match self {
            AcmeError::HttpRequest(error) | AcmeError::NonceRequest(error) => {
                error.is_connect()
                    || error.is_timeout()
                    || error.is_request()
                    || error.status().is_some_and(|s| s.is_server_error())
            }
            AcmeError::HttpStatus { status, .. } => status.is_server_error(),
            AcmeError::Acme(document) => document
                .status()
                .is_some_and(|status| status.is_server_error()),
            _ => false,
        }
    }

    /// The problem document, if the ACME service returned one.
    pub fn document(&self) -> Option<&AcmeErrorDocument> {
        match self {
            AcmeError::Acme(document) => Some(document),
            _ => None,
        }
    }
}

impl From<AcmeErrorDocument> for AcmeError {
    fn from(value: AcmeErrorDocument) -> Self {
        AcmeError::Acme(value)
    }
}

mod acme {
    use std::fmt;

    use serde::Deserialize;
    use thiserror::Error;

    const URN_PREFIX: &str = "urn:ietf:params:acme:error:";

    /// Error document returned by ACME servers when a request has caused an
    /// error.
    ///
    /// ACME Error documents follow RFC 7807 "Problem Details for HTTP APIs".
    #[derive(Debug, Clone, Error, Deserialize)]
    #[serde(from = "RawErrorInfo")]
    #[error("{kind}: {detail}")]
    pub struct AcmeErrorDocument {
        kind: String,
        code: AcmeErrorCode,
        detail: String,
        status: Option<http::StatusCode>,
        subproblems: Vec<AcmeErrorDocument>,
    }

    impl AcmeErrorDocument {
        /// The error code provided in the ACME error document.
        pub fn code(&self) -> &AcmeErrorCode {
            &self.code
        }

        /// The raw `type` field, usually an ACME error URN.
        pub fn kind(&self) -> &str {
            &self.kind
        }

        /// The error message, intended to be human readable, in the
        /// ACME error document.
        pub fn message(&self) -> &str {
            &self.detail
        }

        /// The HTTP status this document was delivered with.
        pub fn status(&self) -> Option<http::StatusCode> {
            self.status
        }

        /// Per-identifier problems attached to this document.
        pub fn subproblems(&self) -> &[AcmeErrorDocument] {
            &self.subproblems
        }

        pub(crate) fn with_status(mut self, status: http::StatusCode) -> Self {
            self.status = Some(status);
            self
        }
    }

    /// Specific code indicating the kind of error that an ACME server
    /// encountered.
    ///
    /// These codes are specified in RFC 8555 section 6.7.
    /// Not all codes are distinguished here.
    #[derive(Debug, Clone, PartialEq, Eq)]
    #[non_exhaustive]
    pub enum AcmeErrorCode {
        /// A bad nonce was sent with the request. Try again with a new nonce.
        BadNonce,
        /// The request exceeds a rate limit.
        RateLimited,
        /// A contact URL for an account was invalid.
        InvalidContact,
        /// A contact URL for an account used an unsupported protocol scheme.
        UnsupportedContact,
        /// The request specified an account that does not exist.
        AccountDoesNotExist,
        /// The client lacks sufficient authorization.
        Unauthorized,
        /// The request message was malformed.
        Malformed,
        /// The CSR is unacceptable.
        BadCsr,
        /// The server experienced an internal error.
        ServerInternal,
        /// Some other error occured.
        Other(String),
    }

    impl fmt::Display for AcmeErrorCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                AcmeErrorCode::BadNonce => f.write_str("badNonce"),
                AcmeErrorCode::RateLimited => f.write_str("rateLimited"),
                AcmeErrorCode::InvalidContact => f.write_str("invalidContact"),
                AcmeErrorCode::UnsupportedContact => f.write_str("unsupportedContact"),
                AcmeErrorCode::AccountDoesNotExist => f.write_str("accountDoesNotExist"),
                AcmeErrorCode::Unauthorized => f.write_str("unauthorized"),
                AcmeErrorCode::Malformed => f.write_str("malformed"),
                AcmeErrorCode::BadCsr => f.write_str("badCSR"),
                AcmeErrorCode::ServerInternal => f.write_str("serverInternal"),
                AcmeErrorCode::Other(message) => f.write_str(message),
            }
        }
    }

    impl From<&str> for AcmeErrorCode {
        fn from(value: &str) -> Self {
            let Some(tag) = value.strip_prefix(URN_PREFIX) else {
                tracing::warn!("Unexpected error URN: {value}");
                return AcmeErrorCode::Other(value.to_owned());
            };

            match tag {
                "badNonce" => AcmeErrorCode::BadNonce,
                "rateLimited" => AcmeErrorCode::RateLimited,
                "invalidContact" => AcmeErrorCode::InvalidContact,
                "unsupportedContact" => AcmeErrorCode::UnsupportedContact,
                "accountDoesNotExist" => AcmeErrorCode::AccountDoesNotExist,
                "unauthorized" => AcmeErrorCode::Unauthorized,
                "malformed" => AcmeErrorCode::Malformed,
                "badCSR" => AcmeErrorCode::BadCsr,
                "serverInternal" => AcmeErrorCode::ServerInternal,
                _ => AcmeErrorCode::Other(value.to_owned()),
            }
        }
    }

    /// Wire format for an ACME error document.
    #[derive(Debug, Clone, Deserialize)]
    struct RawErrorInfo {
        #[serde(default)]
        r#type: String,
        #[serde(default)]
        detail: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        subproblems: Vec<RawErrorInfo>,
    }

    impl From<RawErrorInfo> for AcmeErrorDocument {
        fn from(value: RawErrorInfo) -> Self {
            AcmeErrorDocument {
                code: AcmeErrorCode::from(value.r#type.as_str()),
                kind: value.r#type,
                detail: value.detail,
                status: value
                    .status
                    .and_then(|s| http::StatusCode::from_u16(s).ok()),
                subproblems: value.subproblems.into_iter().map(Into::into).collect(),
            }
        }
    }
}
