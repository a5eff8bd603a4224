//! HTTP requests which adhere to RFC 8555
//!
//! [RFC 8555][] requires that most ACME HTTP requests (other than to the
//! directory endpoint and the new-nonce endpoint) be authenticated with a
//! JWS token using the flattened JSON format.
//!
//! For example, a request to create a new account might look like:
//! ```text
//! POST /acme/new-account HTTP/1.1
//! Host: example.com
//! Content-Type: application/jose+json
//!
//! {
//!   "protected": base64url({
//!     "alg": "ES256",
//!     "jwk": {...
//!     },
//!     "nonce": "6S8IqOGY7eL2lsGoTZYifg",
//!     "url": "https://example.com/acme/new-account"
//!   }),
//!   "payload": base64url({
//!     "termsOfServiceAgreed": true,
//!     "contact": [
//!       "mailto:cert-admin@example.org"
//!     ]
//!   }),
//!   "signature": "RZPOnYoPs1PhjszF...-nh6X1qtOFPB519I"
//! }
//! ```
//!
//! [RFC 8555]: https://datatracker.ietf.org/doc/html/rfc8555

use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use serde::Serialize;

use super::jose::{AccountKeyIdentifier, Nonce, ProtectedHeader, UnsignedToken};
use super::AcmeError;
use super::Url;
use crate::key::SigningKey;

const CONTENT_JOSE: &str = "application/jose+json";

/// The HTTP request method in use with this ACME request.
///
/// All ACME requests use POST under the hood, since they all contain
/// a JWS token to validate that the request is coming from
/// the account holder. However, sometimes the ACME server wants the
/// request to have GET semantics. In those cases, the payload will
/// be the empty string.
#[derive(Debug, Clone, Copy)]
pub enum Method<T> {
    /// POST-as-GET request with an empty string payload
    Get,
    /// POST request with a specific JSON payload.
    Post(T),
}

/// The signing key and method for an ACME request.
///
/// Identified requests correspond to an account which is already registered
/// with the ACME provider: the JWS carries the account URL as `kid`.
/// Signed requests embed the public key as `jwk`, and are only used
/// when creating or looking up an account.
#[derive(Debug, Clone)]
pub enum Key {
    /// A signing key which will be identified to the ACME service as a
    /// known account.
    Identified {
        /// The account URL.
        identifier: AccountKeyIdentifier,
        /// The account key.
        key: Arc<SigningKey>,
    },

    /// A signing key which will have the public component provided as a
    /// JWK structure inside the signed part of the request.
    Signed {
        /// The account key.
        key: Arc<SigningKey>,
    },
}

impl Key {
    fn header(&self, url: Url, nonce: Nonce) -> ProtectedHeader {
        match self {
            Key::Identified { identifier, key } => {
                ProtectedHeader::new_acme_account_header(key, identifier, url, nonce)
            }
            Key::Signed { key } => ProtectedHeader::new_acme_header(key, url, nonce),
        }
    }

    /// A reference to the signing key.
    pub fn key(&self) -> &Arc<SigningKey> {
        match self {
            Key::Identified { key, .. } => key,
            Key::Signed { key } => key,
        }
    }
}

impl From<(Arc<SigningKey>, AccountKeyIdentifier)> for Key {
    fn from((key, identifier): (Arc<SigningKey>, AccountKeyIdentifier)) -> Self {
        Key::Identified { identifier, key }
    }
}

impl From<Arc<SigningKey>> for Key {
    fn from(key: Arc<SigningKey>) -> Self {
        Key::Signed { key }
    }
}

/// A request which follows the RFC 8555 protocol for HTTP with JWS authentication
///
/// This structure contains all of the materials *except* the
/// anti-replay [nonce][Nonce] which are required to create an appropriate HTTP
/// request. The [nonce][Nonce] is left out of this object so that if the
/// [`super::Client`] encounters a bad [nonce][Nonce], it can re-sign the same
/// request with a new [nonce][Nonce] without re-building the request.
///
/// ```
/// # use std::sync::Arc;
/// # use dnsacme::key::SignatureKind;
/// # use dnsacme::protocol::{Url, Request};
/// let key = Arc::new(SignatureKind::default().random().unwrap());
/// let url: Url = "https://letsencrypt.test/acme/order/1".parse().unwrap();
///
/// let request = Request::get(url, key);
/// let signed = request.sign("nonce".into()).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Request<T> {
    method: Method<T>,
    url: Url,
    key: Key,
    headers: HeaderMap,
}

impl<T> Request<T> {
    fn new<K>(method: Method<T>, url: Url, key: K) -> Self
    where
        K: Into<Key>,
    {
        Self {
            method,
            url,
            key: key.into(),
            headers: Default::default(),
        }
    }

    /// Create a `POST` request with a given payload.
    ///
    /// The payload will be serialized to JSON and included in the JWS. The [`Url`]
    /// is required as it is a part of the JWS header.
    pub fn post<K>(payload: T, url: Url, key: K) -> Self
    where
        K: Into<Key>,
    {
        Self::new(Method::Post(payload), url, key)
    }

    /// Mutable reference to the headers to be sent by this request.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Inspect the headers to be sent with this request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The target URL of this request.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Request<()> {
    /// Create a `POST-as-GET` request with an empty payload.
    pub fn get<K>(url: Url, key: K) -> Self
    where
        K: Into<Key>,
    {
        Self::new(Method::Get, url, key)
    }
}

impl<T> Request<T>
where
    T: Serialize,
{
    fn token(&self, nonce: Nonce) -> UnsignedToken<&T> {
        let header = self.key.header(self.url.clone(), nonce);

        match &self.method {
            Method::Get => UnsignedToken::get(header),
            Method::Post(payload) => UnsignedToken::post(header, payload),
        }
    }

    /// Sign and finalize this request so that it can be sent over HTTP.
    ///
    /// Normally this is not necessary, [`crate::protocol::Client::execute`]
    /// signs requests with the correct nonce.
    pub fn sign(&self, nonce: Nonce) -> Result<SignedRequest, AcmeError> {
        let signed_token = self.token(nonce).sign(self.key.key())?;
        let mut request = reqwest::Request::new(http::Method::POST, self.url.clone().into());
        *request.headers_mut() = self.headers.clone();
        request.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_JOSE),
        );
        let body = serde_json::to_vec(&signed_token).map_err(AcmeError::ser)?;
        #[cfg(feature = "trace-requests")]
        tracing::trace!(url = %self.url, "REQ: {}", String::from_utf8_lossy(&body));
        *request.body_mut() = Some(body.into());

        Ok(SignedRequest(request))
    }
}

/// A request which has been signed with a private key.
///
/// This request is ready to be transmitted over HTTP.
pub struct SignedRequest(reqwest::Request);

impl SignedRequest {
    pub(crate) fn into_inner(self) -> reqwest::Request {
        self.0
    }
}

impl From<SignedRequest> for reqwest::Request {
    fn from(value: SignedRequest) -> Self {
        value.0
    }
}
