//! Checking that a challenge record is visible to public resolvers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A TXT lookup failed for a reason other than the record being absent.
#[derive(Debug, Error)]
#[error("TXT lookup for {name} failed: {message}")]
pub struct ResolveError {
    /// The name being looked up.
    pub name: String,

    /// Resolver error message.
    pub message: String,
}

/// Looks up TXT records.
///
/// An absent record is an empty list, not an error.
#[async_trait]
pub trait TxtResolver: Send + Sync + std::fmt::Debug {
    /// All TXT values at `name`, each with its character strings joined.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError>;
}

/// A [`TxtResolver`] which asks a single nameserver over UDP, without caching.
#[derive(Debug)]
pub struct HickoryTxtResolver {
    nameserver: IpAddr,
    resolver: TokioResolver,
}

impl HickoryTxtResolver {
    /// Resolve against the nameserver at `nameserver` port 53.
    pub fn new(nameserver: IpAddr, timeout: Duration) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(nameserver, 53),
            Protocol::Udp,
        ));

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        opts.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self {
            nameserver,
            resolver,
        }
    }

    /// The nameserver queried by this resolver.
    pub fn nameserver(&self) -> IpAddr {
        self.nameserver
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Err(error) => {
                let message = error.to_string();
                let lowered = message.to_lowercase();
                if lowered.contains("no records found")
                    || lowered.contains("nxdomain")
                    || lowered.contains("record not found")
                {
                    Ok(Vec::new())
                } else {
                    Err(ResolveError {
                        name: name.to_owned(),
                        message,
                    })
                }
            }
        }
    }
}

/// How challenge record propagation is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Skip the check entirely.
    pub enabled: bool,

    /// Resolvers which must all see the record.
    pub nameservers: Vec<IpAddr>,

    /// Number of lookups per resolver before giving up.
    pub attempts: u32,

    /// Delay between rounds of lookups, and before the first one.
    #[serde(with = "crate::duration::secs")]
    pub delay: Duration,

    /// Timeout for a single lookup.
    #[serde(with = "crate::duration::secs")]
    pub lookup_timeout: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
            attempts: 12,
            delay: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

/// Waits for a TXT value to be visible from every configured resolver.
#[derive(Debug, Clone)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolvers: Vec<Arc<dyn TxtResolver>>,
}

impl PropagationChecker {
    /// One [`HickoryTxtResolver`] per configured nameserver.
    pub fn new(config: PropagationConfig) -> Self {
        let resolvers = config
            .nameservers
            .iter()
            .map(|ip| {
                Arc::new(HickoryTxtResolver::new(*ip, config.lookup_timeout))
                    as Arc<dyn TxtResolver>
            })
            .collect();
        Self { config, resolvers }
    }

    /// Check with custom resolvers instead of the configured nameservers.
    pub fn with_resolvers(config: PropagationConfig, resolvers: Vec<Arc<dyn TxtResolver>>) -> Self {
        Self { config, resolvers }
    }

    /// The configuration for this checker.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Wait until every resolver returns `value` at `fqdn`.
    ///
    /// Returns `false` when the budget runs out. Callers proceed anyway:
    /// the ACME provider's own resolvers may still see the record.
    pub async fn wait_for(&self, fqdn: &str, value: &str) -> bool {
        if !self.config.enabled || self.resolvers.is_empty() {
            return true;
        }

        tracing::debug!(%fqdn, resolvers = self.resolvers.len(), "Waiting for TXT record propagation");
        let mut pending: Vec<&Arc<dyn TxtResolver>> = self.resolvers.iter().collect();

        for attempt in 1..=self.config.attempts.max(1) {
            tokio::time::sleep(self.config.delay).await;

            let results = futures::future::join_all(
                pending.iter().map(|resolver| resolver.lookup_txt(fqdn)),
            )
            .await;

            let mut remaining = Vec::new();
            for (resolver, result) in pending.into_iter().zip(results) {
                match result {
                    Ok(values) if values.iter().any(|found| found == value) => {}
                    Ok(values) => {
                        tracing::trace!(%fqdn, ?resolver, ?values, "Record not visible yet");
                        remaining.push(resolver);
                    }
                    Err(error) => {
                        tracing::trace!(%fqdn, %error, "TXT lookup failed");
                        remaining.push(resolver);
                    }
                }
            }

            if remaining.is_empty() {
                tracing::debug!(%fqdn, attempt, "TXT record propagated");
                return true;
            }
            pending = remaining;
        }

        tracing::warn!(
            %fqdn,
            missing = pending.len(),
            "TXT record not visible from every resolver, continuing anyway"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct DelayedResolver {
        visible_after: u32,
        calls: AtomicU32,
        value: String,
    }

    #[async_trait]
    impl TxtResolver for DelayedResolver {
        async fn lookup_txt(&self, _name: &str) -> Result<Vec<String>, ResolveError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.visible_after {
                Ok(vec!["unrelated".into(), self.value.clone()])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn resolver(visible_after: u32) -> Arc<DelayedResolver> {
        Arc::new(DelayedResolver {
            visible_after,
            calls: AtomicU32::new(0),
            value: "digest".into(),
        })
    }

    fn config() -> PropagationConfig {
        PropagationConfig {
            attempts: 4,
            delay: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_every_resolver() {
        let fast = resolver(1);
        let slow = resolver(3);
        let checker = PropagationChecker::with_resolvers(config(), vec![fast.clone() as Arc<dyn TxtResolver>, slow.clone()]);

        assert!(checker.wait_for("_acme-challenge.example.com", "digest").await);
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let never = resolver(100);
        let checker = PropagationChecker::with_resolvers(config(), vec![never.clone() as Arc<dyn TxtResolver>]);

        assert!(!checker.wait_for("_acme-challenge.example.com", "digest").await);
        assert_eq!(never.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn disabled_check_passes_immediately() {
        let never = resolver(100);
        let config = PropagationConfig {
            enabled: false,
            ..config()
        };
        let checker = PropagationChecker::with_resolvers(config, vec![never.clone() as Arc<dyn TxtResolver>]);

        assert!(checker.wait_for("_acme-challenge.example.com", "digest").await);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_resolvers() {
        let config = PropagationConfig::default();
        assert_eq!(config.nameservers.len(), 3);
        assert!(config.enabled);
    }
}
