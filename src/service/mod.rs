//! A high-level implementation of an ACME client
//!
//! Used for managing an acocunt and issuing certificates. The usual flow
//! for a client is:
//!
//! 1. Create a [`Provider`].
//! 2. Get or create an [`Account`], see [`account::ensure_account`].
//! 3. Create an [`Order`].
//! 4. For each identity, complete the `dns-01` challenge attached to each
//!    [`Authorization`] on that order.
//! 5. Finalize the order, submitting a certificate signing request, using [`Order::finalize`].
//! 6. Download the certificate with [`Order::download`].

#![deny(unsafe_code)]
#![deny(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::SigningKey;
use crate::protocol::{AcmeError, RetryPolicy, Url};
use crate::schema::directory::Directory;

pub mod account;
pub mod authorization;
mod client;
pub mod order;

pub use self::account::Account;
pub use self::authorization::Authorization;
pub use self::order::Order;

use self::client::Client;

/// An ACME Service Provider
///
/// Providers are identified by a directory URL, and keep the fetched
/// directory alongside the shared HTTP client.
#[derive(Debug, Clone)]
pub struct Provider {
    name: Option<String>,
    url: Url,
    directory: Directory,
    client: Client,
}

impl Provider {
    /// The name of this ACME Service provider, if specified
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The directory URL for this provider.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The configuration directory for this ACME service provider
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Get or create an account identified by `key`.
    pub fn account(&self, key: std::sync::Arc<SigningKey>) -> self::account::AccountBuilder {
        self::account::AccountBuilder::new(self.clone(), key)
    }

    #[inline]
    pub(crate) fn client(&self) -> &self::client::Client {
        &self.client
    }

    /// Get a builder for a new provider.
    ///
    /// See [`ProviderBuilder`] for more information.
    pub fn build() -> ProviderBuilder {
        ProviderBuilder::new()
    }
}

/// Error occured when building a provider,
/// or building the HTTP client used to power the provider.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// An error occured while building the underlying HTTP client.
    #[error("Building HTTPS client: {0}")]
    Client(#[source] reqwest::Error),

    /// No directory URL was specified.
    #[error("Missing provider URL")]
    Url,

    /// An error occured while fetching the provider directory.
    #[error("Fetching provider directory: {0}")]
    Directory(#[source] AcmeError),
}

/// Build a provider from a directory or the URL of a directory.
#[derive(Debug)]
pub struct ProviderBuilder {
    client: crate::protocol::client::ClientBuilder,
    url: Option<Url>,
    directory: Option<Directory>,
    name: Option<String>,
}

impl ProviderBuilder {
    fn new() -> Self {
        ProviderBuilder {
            client: crate::protocol::client::Client::builder(),
            url: None,
            directory: None,
            name: None,
        }
    }

    /// Explicitly add an additional root certificate to the underlying HTTP client.
    pub fn add_root_certificate(mut self, cert: reqwest::Certificate) -> Self {
        self.client = self.client.add_root_certificate(cert);
        self
    }

    /// Set a timeout for requests to complete.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.timeout(timeout);
        self
    }

    /// Set a timeout for requests to connect.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.connect_timeout(timeout);
        self
    }

    /// Set how requests are retried after transient failures and `badNonce`.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.client = self.client.retry_policy(retry);
        self
    }

    /// Set the dircetory URL, which will be used to fetch the directory if it isn't provided.
    pub fn directory_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the full directory structure. This will be used instead of fetching the directory from
    /// the provided URL.
    pub fn directory(mut self, directory: Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the name of the provider, used for diagnostic messages.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the provider.
    pub async fn build(self) -> ::std::result::Result<Provider, BuilderError> {
        let mut client = self.client.build().map_err(BuilderError::Client)?;

        let url = self.url.ok_or(BuilderError::Url)?;

        let directory = if let Some(directory) = self.directory {
            directory
        } else {
            tracing::debug!(%url, "Fetching ACME directory");
            client
                .get(url.clone())
                .await
                .map_err(BuilderError::Directory)?
                .into_inner()
        };

        client.set_new_nonce_url(directory.new_nonce.clone());

        Ok(Provider {
            name: self.name,
            url,
            directory,
            client: Client::new(client),
        })
    }
}

/// How the state of an authorization or order is polled.
///
/// The delay between polls starts at `initial_delay` and doubles up to
/// `max_delay`. A `Retry-After` header from the provider raises the delay
/// for that one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay after the first unfinished poll.
    #[serde(with = "crate::duration::secs")]
    pub initial_delay: Duration,

    /// Ceiling for the delay between polls.
    #[serde(with = "crate::duration::secs")]
    pub max_delay: Duration,

    /// How long one authorization may take to validate.
    #[serde(with = "crate::duration::secs")]
    pub authorization_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            authorization_timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    pub(crate) fn delays(&self) -> PollDelays<'_> {
        PollDelays {
            policy: self,
            next: self.initial_delay,
        }
    }
}

/// Successive poll delays for one resource.
pub(crate) struct PollDelays<'p> {
    policy: &'p PollPolicy,
    next: Duration,
}

impl PollDelays<'_> {
    /// The delay before the next poll, at least `retry_after` when the provider asked for it.
    pub(crate) fn next(&mut self, retry_after: Option<Duration>) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.policy.max_delay);
        retry_after.map_or(delay, |floor| delay.max(floor))
    }
}

/// Included ACME provider information.
pub mod provider {

    /// The ACME directory URL for Let's Encrypt.
    pub const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";

    /// The ACME directory URL for the Let's Encrypt staging environment.
    pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
}
