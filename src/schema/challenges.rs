//! # ACME Challenges
//!
//! Challenges used to validate ownership of an identifier, as part
//! of an authorization. Only `dns-01` is ever fulfilled; other challenge
//! types are parsed so that authorizations offering them can be read.

use std::ops::Deref;

use base64ct::Encoding;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{ser, Deserialize};
use sha2::Digest;

use crate::key::SigningKey;
use crate::protocol::errors::AcmeErrorDocument;
use crate::protocol::Url;

/// Label prepended to a domain to form the DNS-01 record name.
pub const DNS01_LABEL: &str = "_acme-challenge";

#[derive(Debug, Clone, Deserialize)]
struct ChallengeInfo {
    url: Url,
    status: ChallengeStatus,
    #[serde(default)]
    validated: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<AcmeErrorDocument>,
}

/// ACME challenge variety.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum Challenge {
    /// HTTP-01 challenge, which is never fulfilled here.
    #[serde(rename = "http-01")]
    Http01(TokenChallenge),

    /// DNS-01 challenge where the client must set a DNS TXT record for a domain.
    #[serde(rename = "dns-01")]
    Dns01(Dns01Challenge),

    /// Any other challenge type, such as `tls-alpn-01`.
    #[serde(other)]
    UnknownChallenge,
}

impl Challenge {
    fn info(&self) -> Option<&ChallengeInfo> {
        match self {
            Challenge::Http01(http) => Some(&http.info),
            Challenge::Dns01(dns) => Some(&dns.info),
            _ => None,
        }
    }

    /// The name of the challenge type.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Challenge::Http01(_) => Some("http-01"),
            Challenge::Dns01(_) => Some("dns-01"),
            _ => None,
        }
    }

    /// The URL of the challenge.
    pub fn url(&self) -> Option<&Url> {
        self.info().map(|i| &i.url)
    }

    /// Status of the challenge.
    pub fn status(&self) -> Option<ChallengeStatus> {
        self.info().map(|i| i.status)
    }

    /// When was this challenge validated?
    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        self.info().and_then(|i| i.validated)
    }

    /// Get the error document, if this challenge has failed.
    pub fn error(&self) -> Option<&AcmeErrorDocument> {
        self.info().and_then(|i| i.error.as_ref())
    }

    /// Get the inner DNS-01 challenge, if this is an DNS-01 challenge.
    pub fn dns01(&self) -> Option<&Dns01Challenge> {
        match self {
            Challenge::Dns01(dns) => Some(dns),
            _ => None,
        }
    }
}

/// State of the ACME challenge.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    /// This challenge has not been submitted.
    Pending,
    /// The client has indicated that this challenge is ready to be validated, but
    /// the server has not yet validated it.
    Processing,

    /// The server has validated this challenge.
    Valid,

    /// The server has validated this challenge, but the validation failed.
    Invalid,
}

/// The challenge authorization token, which combines the provided token
/// with the thumbprint of the account signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthorization(String);

impl KeyAuthorization {
    /// `token || '.' || base64url(SHA-256(JWK))`
    pub fn new(token: &str, key: &SigningKey) -> KeyAuthorization {
        let thumb = key.as_jwk().thumbprint();
        KeyAuthorization(format!("{token}.{thumb}"))
    }

    /// The DNS-01 TXT record value, `base64url(SHA-256(key authorization))`.
    pub fn digest(&self) -> String {
        let digest = sha2::Sha256::digest(self.0.as_bytes());
        base64ct::Base64UrlUnpadded::encode_string(&digest)
    }
}

impl Deref for KeyAuthorization {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

/// A challenge which is answered with a key authorization for a token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenChallenge {
    #[serde(flatten)]
    info: ChallengeInfo,
    token: String,
}

impl TokenChallenge {
    /// The token value used for challenge validation.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// DNS-01 challenge.
///
/// This challenge requires the client to create a TXT record with a specific value.
#[derive(Debug, Clone, Deserialize)]
pub struct Dns01Challenge {
    #[serde(flatten)]
    info: ChallengeInfo,
    token: String,
}

impl Dns01Challenge {
    /// The token value used for challenge validation.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The URL for this challenge object with the ACME provider.
    pub fn url(&self) -> &Url {
        &self.info.url
    }

    /// Status of the challenge.
    pub fn status(&self) -> ChallengeStatus {
        self.info.status
    }

    /// The name of the DNS TXT record that should be created.
    ///
    /// Wildcard labels are dropped: `*.example.com` and `example.com` share
    /// `_acme-challenge.example.com`.
    pub fn record(&self, domain: &str) -> String {
        let domain = domain.trim_end_matches('.');
        let domain = domain.strip_prefix("*.").unwrap_or(domain);
        format!("{DNS01_LABEL}.{domain}")
    }

    /// The value of the DNS TXT record that should be created.
    pub fn digest(&self, account_key: &SigningKey) -> String {
        self.authorization(account_key).digest()
    }

    /// The key authorization object for this challenge.
    pub fn authorization(&self, account_key: &SigningKey) -> KeyAuthorization {
        KeyAuthorization::new(&self.token, account_key)
    }
}

/// An empty request to indicate that the challenge is ready to be validated.
#[derive(Debug, Default)]
pub struct ChallengeReadyRequest;

impl ser::Serialize for ChallengeReadyRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let map = serializer.serialize_map(Some(0))?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_challenge(token: &str) -> Dns01Challenge {
        serde_json::from_value(serde_json::json!({
            "url": "https://ca.test/acme/chall/1",
            "status": "pending",
            "token": token,
        }))
        .unwrap()
    }

    #[test]
    fn key_authorization_and_digest() {
        let key = crate::key!("ec-p256");
        let challenge = dns_challenge("token-abc");
        assert_eq!(
            &*challenge.authorization(&key),
            "token-abc.TbUlLHAcRq3nl1x7GDwcYkh0koLESBqFEKRXheGvz5E"
        );
        assert_eq!(
            challenge.digest(&key),
            "8LWDy6FZkcuZJx2ZsM8FtUVHPoaehEkQcppTRvec8FY"
        );
    }

    #[test]
    fn wildcard_record_name() {
        let challenge = dns_challenge("t");
        assert_eq!(
            challenge.record("*.example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(challenge.record("example.com."), "_acme-challenge.example.com");
    }

    #[test]
    fn unknown_challenges_are_parsed() {
        let challenge: Challenge = serde_json::from_value(serde_json::json!({
            "type": "tls-alpn-01",
            "url": "https://ca.test/acme/chall/2",
            "status": "pending",
            "token": "abc"
        }))
        .unwrap();
        assert!(matches!(challenge, Challenge::UnknownChallenge));
        assert!(challenge.dns01().is_none());
        assert!(challenge.url().is_none());
    }

    #[test]
    fn challenge_ready_is_empty_object() {
        assert_eq!(serde_json::to_string(&ChallengeReadyRequest).unwrap(), "{}");
    }
}
