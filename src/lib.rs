//! # DNS-01 certificate issuance
//!
//! `dnsacme` implements enough of the [ACME protocol](https://tools.ietf.org/html/rfc8555)
//! to issue and renew certificates from Let's Encrypt (or any other ACME v2
//! provider) by answering `dns-01` challenges.
//!
//! ## Features
//!
//! Only `dns-01` challenges are fulfilled, so wildcard names are supported.
//! DNS hosting is pluggable: callers implement [`DnsProvider`] to create and
//! delete TXT records with whatever backend hosts their zone.
//!
//! Account keys may be ECDSA P-256 or RSA 2048. Certificate keys are ECDSA
//! P-256. Revocation and account key rollover are not supported.
//!
//! ## Usage
//!
//! Most callers only need [`issue_or_renew`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dnsacme::{issue_or_renew, DnsProvider, IssueConfig};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run(dns: Arc<dyn DnsProvider>) -> Result<(), dnsacme::IssueError> {
//! let config = IssueConfig::new(
//!     ["example.com", "*.example.com"],
//!     "admin@example.com",
//!     "/etc/dnsacme",
//!     true,
//! );
//! let bundle = issue_or_renew(&config, dns, CancellationToken::new()).await?;
//! println!("valid until {}", bundle.not_after);
//! # Ok(())
//! # }
//! ```
//!
//! The crate is split into several levels of api:
//!
//! - [`issue`] runs a whole order and manages the certificate store.
//! - [`service`] is the high level ACME API: accounts, orders and authorizations.
//! - [`dns`] publishes challenge records and checks their propagation.
//! - [`schema`] provides the data structures for individual ACME endpoints.
//! - [`protocol`] provides the JWS protocol and the nonce tracking HTTP client.
//! - [`key`] and [`cert`] provide account keys, certificate keys and CSRs.

pub mod cert;
pub mod dns;
pub mod error;
pub mod issue;
pub mod key;
pub mod protocol;
pub mod schema;
pub mod service;
pub mod store;

mod duration;

pub use crate::dns::{DnsProvider, ProviderError, RecordHandle};
pub use crate::error::IssueError;
pub use crate::issue::{issue_or_renew, issue_or_renew_with, IssueConfig};
pub use crate::store::CertificateBundle;
