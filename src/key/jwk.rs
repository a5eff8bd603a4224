//! JSON Web Keys and RFC 7638 thumbprints.
use std::fmt;

use base64ct::Encoding;
use serde::ser::{self, SerializeStruct};
use sha2::Digest;

/// JSON Web Key structure for the public half of an account key.
///
/// JWK serializes the information required to verify a signature in a
/// well-known JSON format. It is sent once, when the account is created,
/// and afterwards only its [thumbprint](Jwk::thumbprint) is used, to build
/// key authorizations for challenges.
///
/// Members always serialize in lexicographic order, which is the canonical
/// form required for thumbprints.
#[derive(Clone, PartialEq, Eq)]
pub struct Jwk(InnerJwk);

#[derive(Clone, PartialEq, Eq)]
enum InnerJwk {
    EllipticCurve {
        crv: &'static str,
        x: String,
        y: String,
    },
    Rsa {
        n: String,
        e: String,
    },
}

fn b64(data: &[u8]) -> String {
    base64ct::Base64UrlUnpadded::encode_string(data)
}

impl Jwk {
    pub(crate) fn elliptic_curve(crv: &'static str, x: Vec<u8>, y: Vec<u8>) -> Self {
        Jwk(InnerJwk::EllipticCurve {
            crv,
            x: b64(&x),
            y: b64(&y),
        })
    }

    pub(crate) fn rsa(n: Vec<u8>, e: Vec<u8>) -> Self {
        Jwk(InnerJwk::Rsa {
            n: b64(&n),
            e: b64(&e),
        })
    }

    /// The canonical JSON text of the required members, without whitespace.
    pub fn canonical(&self) -> String {
        // All member values are base64url text, which never needs JSON escaping.
        match &self.0 {
            InnerJwk::EllipticCurve { crv, x, y } => {
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
            InnerJwk::Rsa { n, e } => format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#),
        }
    }

    /// An RFC 7638 thumbprint, which uniquely identifies this JWS cryptographic
    /// key.
    pub fn thumbprint(&self) -> String {
        let digest = sha2::Sha256::digest(self.canonical().as_bytes());
        b64(&digest)
    }
}

impl fmt::Debug for Jwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            InnerJwk::EllipticCurve { crv, .. } => f.debug_tuple("Jwk").field(crv).finish(),
            InnerJwk::Rsa { .. } => f.debug_tuple("Jwk").field(&"RSA").finish(),
        }
    }
}

impl ser::Serialize for Jwk {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match &self.0 {
            InnerJwk::EllipticCurve { crv, x, y } => {
                let mut state = serializer.serialize_struct("Jwk", 4)?;
                state.serialize_field("crv", crv)?;
                state.serialize_field("kty", "EC")?;
                state.serialize_field("x", x)?;
                state.serialize_field("y", y)?;
                state.end()
            }
            InnerJwk::Rsa { n, e } => {
                let mut state = serializer.serialize_struct("Jwk", 3)?;
                state.serialize_field("e", e)?;
                state.serialize_field("kty", "RSA")?;
                state.serialize_field("n", n)?;
                state.end()
            }
        }
    }
}
