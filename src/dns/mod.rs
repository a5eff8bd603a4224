//! # DNS-01 challenge records
//!
//! The engine never talks to a DNS host directly. Callers inject a
//! [`DnsProvider`] which can create and delete TXT records, and the
//! [`DnsChallengeFulfiller`] drives it: publishing one
//! `_acme-challenge.<domain>` record per authorization, retrying flaky
//! provider calls, and withdrawing everything it published once the order
//! is over.
//!
//! [`PropagationChecker`] confirms that public resolvers can see a record
//! before the ACME provider is asked to look for it.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fulfiller;
mod propagation;

pub use self::fulfiller::{DnsChallengeFulfiller, DnsChallengeRecord};
pub use self::propagation::{
    HickoryTxtResolver, PropagationChecker, PropagationConfig, ResolveError, TxtResolver,
};

/// Label prepended to the domain for the challenge TXT record.
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL, in seconds, for challenge TXT records.
pub const CHALLENGE_TTL: u32 = 120;

/// A failure reported by a [`DnsProvider`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Human readable description from the DNS backend.
    pub message: String,
}

impl ProviderError {
    /// Create a provider error from any message.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Identifies a TXT record created by a [`DnsProvider`], so that exactly
/// that record can be deleted later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    /// Fully qualified record name, e.g. `_acme-challenge.example.com`.
    pub fqdn: String,

    /// The TXT value which was published.
    pub value: String,

    /// Backend specific record identifier, when the backend returns one.
    pub id: Option<String>,
}

/// A DNS hosting backend that can publish and remove TXT records.
///
/// Implementations must be safe to call concurrently: the authorizations of
/// one order are fulfilled in parallel.
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Short name of the backend, used in logs.
    fn name(&self) -> &str;

    /// Create a TXT record `fqdn` with `value`.
    ///
    /// Several records with the same name and different values must be
    /// able to coexist (`example.com` and `*.example.com` share one name).
    async fn add_txt_record(
        &self,
        fqdn: &str,
        value: &str,
        ttl: u32,
    ) -> Result<RecordHandle, ProviderError>;

    /// Delete a record previously returned by [`DnsProvider::add_txt_record`].
    ///
    /// Deleting a record which is already gone should succeed.
    async fn delete_record(&self, handle: &RecordHandle) -> Result<(), ProviderError>;
}

/// Bounded retries for calls into the [`DnsProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRetry {
    /// Total number of attempts, including the first.
    pub attempts: u32,

    /// Fixed delay between attempts.
    #[serde(with = "crate::duration::secs")]
    pub delay: Duration,
}

impl Default for ProviderRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Strip a wildcard label and any trailing dot from a domain.
pub fn normalize_domain(domain: &str) -> &str {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    domain.strip_suffix('.').unwrap_or(domain)
}

/// The TXT record name which answers the `dns-01` challenge for `domain`.
///
/// `example.com` and `*.example.com` both map to `_acme-challenge.example.com`.
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}
