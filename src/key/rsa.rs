//! RSA account keys, signing with PKCS#1 v1.5 and SHA-256.

use pkcs8::der::zeroize::Zeroizing;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use signature::{SignatureEncoding, Signer};

use super::jwk::Jwk;
use super::KeyError;

const MINIMUM_BITS: usize = 2048;

/// Algorithms for RSA signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaAlgorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256, with a 2048 bit modulus.
    RS256,
}

impl RsaAlgorithm {
    pub(crate) fn random(&self) -> Result<RsaSigningKey, KeyError> {
        match self {
            RsaAlgorithm::RS256 => Ok(RsaSigningKey(RsaPrivateKey::new(&mut OsRng, MINIMUM_BITS)?)),
        }
    }
}

pub(crate) struct RsaSigningKey(RsaPrivateKey);

impl RsaSigningKey {
    fn checked(key: RsaPrivateKey) -> Result<Self, KeyError> {
        let bits = key.size() * 8;
        if bits < MINIMUM_BITS {
            return Err(KeyError::WeakRsaKey(bits));
        }
        key.validate()?;
        Ok(RsaSigningKey(key))
    }

    pub(crate) fn from_pkcs8_pem(data: &str) -> Result<Self, KeyError> {
        Self::checked(RsaPrivateKey::from_pkcs8_pem(data)?)
    }

    pub(crate) fn from_pkcs1_pem(data: &str) -> Result<Self, KeyError> {
        Self::checked(RsaPrivateKey::from_pkcs1_pem(data)?)
    }

    pub(crate) fn to_pkcs8_pem(&self, ending: LineEnding) -> Result<Zeroizing<String>, KeyError> {
        Ok(self.0.to_pkcs8_pem(ending)?)
    }

    pub(crate) fn algorithm(&self) -> RsaAlgorithm {
        RsaAlgorithm::RS256
    }

    pub(crate) fn as_jwk(&self) -> Jwk {
        Jwk::rsa(self.0.n().to_bytes_be(), self.0.e().to_bytes_be())
    }

    pub(crate) fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.0.clone());
        let signature = signer.try_sign(msg)?;
        Ok(signature.to_vec())
    }
}
