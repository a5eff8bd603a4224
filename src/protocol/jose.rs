//! JSON Object Signing and Encryption primitives used in RFC 8555
//! to implement the ACME protocol.

use std::ops::Deref;
use std::sync::Arc;

use serde::{ser, Deserialize, Serialize};
use thiserror::Error;

use super::base64::{Base64Data, Base64JSON};
use super::errors::AcmeError;
use super::Url;

use crate::key::jwk::Jwk;
use crate::key::SigningKey;

/// Sigature algorithms for JWS signatures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// Elliptic curve ECDSA signature with the NIST P-256 curve.
    ES256,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureAlgorithm::ES256 => f.write_str("ES256"),
            SignatureAlgorithm::RS256 => f.write_str("RS256"),
        }
    }
}

/// Anti-replay nonce
///
/// This is a token provided by the ACME server. Each nonce may only be used
/// once, and each reply from the ACME server should contain a new nonce.
///
/// A new nonce is also avaiable from the ACME endpoint `new-nonce`.
///
/// The [`Nonce`] here is really just an opaque string token. Clients
/// may not assume anything about the structure of the nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(String);

impl AsRef<str> for Nonce {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for Nonce {
    fn from(value: String) -> Self {
        Nonce(value)
    }
}

impl From<&str> for Nonce {
    fn from(value: &str) -> Self {
        Nonce(value.to_owned())
    }
}

/// Identifier used by ACME servers for registered accounts
///
/// RFC 8555 specifies that this is the resource URL for the account,
/// as returned in the `Location` header when the account was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeyIdentifier(Arc<Url>);

impl ser::Serialize for AccountKeyIdentifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.deref().serialize(serializer)
    }
}

impl From<Url> for AccountKeyIdentifier {
    fn from(value: Url) -> Self {
        AccountKeyIdentifier(Arc::new(value))
    }
}

impl AccountKeyIdentifier {
    /// Get the underlying account URL.
    pub fn to_url(&self) -> Url {
        self.0.deref().clone()
    }
}

impl std::fmt::Display for AccountKeyIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// The signed header values for the JWS which are common to each
/// request.
///
/// RFC 8555 only supports "Protected" headers, and only a
/// subset of those fields. Exactly one of `jwk` and `kid` is present:
/// `jwk` when creating or looking up an account, `kid` for everything else.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: SignatureAlgorithm,
    #[serde(rename = "kid", skip_serializing_if = "Option::is_none")]
    key_id: Option<AccountKeyIdentifier>,
    #[serde(rename = "jwk", skip_serializing_if = "Option::is_none")]
    web_key: Option<Jwk>,
    nonce: Nonce,
    url: Url,
}

impl ProtectedHeader {
    /// Create a new protected header based on a signing key without an account
    /// identifier. The public key is embedded as a JWK.
    pub fn new_acme_header(key: &SigningKey, url: Url, nonce: Nonce) -> Self {
        Self {
            algorithm: key.jws_algorithm(),
            web_key: Some(key.as_jwk()),
            key_id: None,
            nonce,
            url,
        }
    }

    /// Create a new protected header based on an account identifier.
    pub fn new_acme_account_header(
        key: &SigningKey,
        account: &AccountKeyIdentifier,
        url: Url,
        nonce: Nonce,
    ) -> Self {
        Self {
            algorithm: key.jws_algorithm(),
            web_key: None,
            key_id: Some(account.clone()),
            nonce,
            url,
        }
    }

    /// The nonce carried by this header.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

#[derive(Debug)]
enum Payload<P> {
    Json(Base64JSON<P>),
    Empty,
}

impl<P> Payload<P>
where
    P: Serialize,
{
    fn serialized_value(&self) -> Result<String, serde_json::Error> {
        match self {
            Payload::Json(data) => data.serialized_value(),
            Payload::Empty => Ok(String::new()),
        }
    }
}

impl<P> ser::Serialize for Payload<P>
where
    P: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Payload::Json(data) => data.serialize(serializer),
            Payload::Empty => serializer.serialize_str(""),
        }
    }
}

/// A JWS token wihtout an attached signature
///
/// This token contains just the unsigned parts which are used as the
/// input to the cryptographic signature.
#[derive(Debug, Serialize)]
pub struct UnsignedToken<P> {
    protected: Base64JSON<ProtectedHeader>,
    payload: Payload<P>,
}

impl<P> UnsignedToken<P> {
    /// Create a JWS token appropriate for an ACME POST-as-GET request.
    ///
    /// The request will have an empty string as the payload.
    pub fn get(protected: ProtectedHeader) -> Self {
        Self {
            protected: protected.into(),
            payload: Payload::Empty,
        }
    }

    /// Create a JWS token appropriate for an ACME `POST` request.
    pub fn post(protected: ProtectedHeader, payload: P) -> Self {
        Self {
            protected: protected.into(),
            payload: Payload::Json(payload.into()),
        }
    }
}

impl<P> UnsignedToken<P>
where
    P: Serialize,
{
    fn signing_input(&self) -> Result<String, SigningError> {
        let header = self
            .protected
            .serialized_value()
            .map_err(SigningError::JsonSerialize)?;
        let payload = self
            .payload
            .serialized_value()
            .map_err(SigningError::JsonSerialize)?;
        Ok(format!("{header}.{payload}"))
    }

    /// Sign this token with the given account key.
    pub fn sign(self, key: &SigningKey) -> Result<SignedToken<P>, SigningError> {
        let message = self.signing_input()?;
        let signature = key.try_sign(message.as_bytes())?;
        Ok(SignedToken {
            target: self,
            signature: Base64Data(signature),
        })
    }
}

/// A JWS token in the flattened JSON serialization, with its signature.
#[derive(Debug, Serialize)]
#[serde(bound(serialize = "P: Serialize"))]
pub struct SignedToken<P> {
    #[serde(flatten)]
    target: UnsignedToken<P>,
    signature: Base64Data<Vec<u8>>,
}

/// Error returned for issues signing a JWS token
#[derive(Debug, Error)]
pub enum SigningError {
    /// An error occured in the cryptographic signature process.
    #[error("signature error")]
    Signing(#[from] signature::Error),

    /// An error occured while trying to serialize the token as JSON.
    #[error("serialization error: {0}")]
    JsonSerialize(#[source] serde_json::Error),
}

impl From<SigningError> for AcmeError {
    fn from(value: SigningError) -> Self {
        match value {
            SigningError::Signing(error) => Self::Signing(error),
            SigningError::JsonSerialize(error) => Self::ser(error),
        }
    }
}

#[cfg(test)]
mod test {
    use base64ct::Encoding;
    use serde_json::Value;

    use super::*;

    fn decode_segment(segment: &Value) -> Value {
        let text = segment.as_str().unwrap();
        let data = base64ct::Base64UrlUnpadded::decode_vec(text).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[test]
    fn new_account_header_embeds_jwk() {
        let key = crate::key!("ec-p256");
        let url: Url = "https://ca.test/acme/new-acct".parse().unwrap();
        let header = ProtectedHeader::new_acme_header(&key, url, "nonce-1".into());

        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["alg"], "ES256");
        assert_eq!(value["nonce"], "nonce-1");
        assert_eq!(value["url"], "https://ca.test/acme/new-acct");
        assert_eq!(value["jwk"]["kty"], "EC");
        assert!(value.get("kid").is_none());
    }

    #[test]
    fn account_header_uses_kid() {
        let key = crate::key!("rsa-2048");
        let account = AccountKeyIdentifier::from(
            "https://ca.test/acme/acct/1".parse::<Url>().unwrap(),
        );
        let url: Url = "https://ca.test/acme/new-order".parse().unwrap();
        let header = ProtectedHeader::new_acme_account_header(&key, &account, url, "n".into());

        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["alg"], "RS256");
        assert_eq!(value["kid"], "https://ca.test/acme/acct/1");
        assert!(value.get("jwk").is_none());
    }

    #[test]
    fn post_as_get_has_empty_payload() {
        let key = crate::key!("ec-p256");
        let url: Url = "https://ca.test/acme/order/1".parse().unwrap();
        let header = ProtectedHeader::new_acme_header(&key, url, "n".into());
        let token = UnsignedToken::<()>::get(header).sign(&key).unwrap();

        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["payload"], "");
        assert_eq!(decode_segment(&value["protected"])["nonce"], "n");
        assert!(!value["signature"].as_str().unwrap().is_empty());
    }

    #[test]
    fn signature_covers_protected_and_payload() {
        use signature::Verifier;

        let key = crate::key!("ec-p256");
        let url: Url = "https://ca.test/acme/new-order".parse().unwrap();
        let header = ProtectedHeader::new_acme_header(&key, url, "n".into());
        let token = UnsignedToken::post(header, serde_json::json!({"a": 1}))
            .sign(&key)
            .unwrap();

        let value = serde_json::to_value(&token).unwrap();
        let message = format!(
            "{}.{}",
            value["protected"].as_str().unwrap(),
            value["payload"].as_str().unwrap()
        );
        let signature = base64ct::Base64UrlUnpadded::decode_vec(value["signature"].as_str().unwrap())
            .unwrap();

        let pem = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/reference-keys/ec-p256.pem"));
        let verifying = {
            use pkcs8::DecodePrivateKey;
            *p256::ecdsa::SigningKey::from_pkcs8_pem(pem).unwrap().verifying_key()
        };
        let signature = p256::ecdsa::Signature::from_slice(&signature).unwrap();
        verifying.verify(message.as_bytes(), &signature).unwrap();
    }
}
