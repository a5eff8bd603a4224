//! ECDSA account keys on the NIST P-256 curve.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs8::der::zeroize::Zeroizing;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use signature::Signer;

use super::jwk::Jwk;
use super::KeyError;

/// Named elliptic curves supported for account keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaAlgorithm {
    /// The NIST P-256 (a.k.a. secp256r1, prime256v1) elliptic curve.
    P256,
}

impl EcdsaAlgorithm {
    pub(crate) fn random(&self) -> EcdsaSigningKey {
        match self {
            EcdsaAlgorithm::P256 => EcdsaSigningKey(p256::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }
}

pub(crate) struct EcdsaSigningKey(p256::ecdsa::SigningKey);

impl EcdsaSigningKey {
    pub(crate) fn from_pkcs8_pem(data: &str) -> Result<Self, pkcs8::Error> {
        Ok(EcdsaSigningKey(p256::ecdsa::SigningKey::from_pkcs8_pem(
            data,
        )?))
    }

    pub(crate) fn from_sec1_pem(data: &str) -> Result<Self, KeyError> {
        let secret = p256::SecretKey::from_sec1_pem(data).map_err(|_| KeyError::Sec1)?;
        Ok(EcdsaSigningKey(p256::ecdsa::SigningKey::from(&secret)))
    }

    pub(crate) fn to_pkcs8_pem(&self, ending: LineEnding) -> Result<Zeroizing<String>, KeyError> {
        Ok(self.0.to_pkcs8_pem(ending)?)
    }

    pub(crate) fn algorithm(&self) -> EcdsaAlgorithm {
        EcdsaAlgorithm::P256
    }

    pub(crate) fn as_jwk(&self) -> Jwk {
        let public = p256::PublicKey::from(self.0.verifying_key());
        let point = public.to_encoded_point(false);

        // An uncompressed point always carries both coordinates.
        let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
        let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
        Jwk::elliptic_curve("P-256", x, y)
    }

    pub(crate) fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        let signature: p256::ecdsa::Signature = self.0.try_sign(msg)?;
        Ok(signature.to_bytes().to_vec())
    }
}
