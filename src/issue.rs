//! # Issuing and renewing certificates
//!
//! [`issue_or_renew`] runs one ACME order from start to finish: it loads or
//! registers the account, creates an order for the configured domains,
//! answers every `dns-01` challenge through the caller's [`DnsProvider`],
//! finalizes the order with a fresh CSR and writes the resulting bundle to
//! the certificate store.
//!
//! Challenge records are always withdrawn before this returns, whether the
//! order succeeded, failed, timed out or was cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cert::{self, CertificateKey, CertificateSigningRequest};
use crate::dns::{
    DnsChallengeFulfiller, DnsProvider, PropagationChecker, PropagationConfig, ProviderRetry,
};
use crate::error::IssueError;
use crate::key::{EcdsaAlgorithm, RsaAlgorithm, SignatureKind, SigningKey};
use crate::protocol::{RetryPolicy, Url};
use crate::schema::authorizations::AuthorizationStatus;
use crate::schema::Identifier;
use crate::service::account::{ensure_account, AccountStorage};
use crate::service::{provider, Authorization, BuilderError, PollPolicy, Provider};
use crate::store::{CertificateBundle, CertificateStore, StoreError, DEFAULT_RENEWAL_DAYS};

/// Algorithm for a newly generated account key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKeyType {
    /// ECDSA on P-256 (`ES256`).
    #[default]
    Ecdsa,
    /// RSA 2048 (`RS256`).
    Rsa,
}

impl From<AccountKeyType> for SignatureKind {
    fn from(value: AccountKeyType) -> Self {
        match value {
            AccountKeyType::Ecdsa => SignatureKind::Ecdsa(EcdsaAlgorithm::P256),
            AccountKeyType::Rsa => SignatureKind::RSA(RsaAlgorithm::RS256),
        }
    }
}

/// Everything [`issue_or_renew`] needs to know.
///
/// Every field has a default, so configuration files only need to name
/// the domains and contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueConfig {
    /// Names to include in the certificate. The first is the primary name,
    /// which names the bundle directory.
    pub domains: Vec<String>,

    /// Contact email addresses for the ACME account.
    pub emails: Vec<String>,

    /// Root of the certificate store.
    pub cert_dir: PathBuf,

    /// Use the Let's Encrypt staging environment.
    pub staging: bool,

    /// Use this ACME directory instead of Let's Encrypt.
    pub directory_url: Option<Url>,

    /// Agree to the provider's terms of service when registering.
    pub accept_terms: bool,

    /// Account key path, `<cert_dir>/account.key` by default.
    pub account_key: Option<PathBuf>,

    /// Account record path, `<cert_dir>/account.json` by default.
    pub account_record: Option<PathBuf>,

    /// Algorithm for a newly generated account key.
    pub account_key_type: AccountKeyType,

    /// Extra PEM root certificates to trust for the ACME endpoint.
    pub root_certificates: Vec<PathBuf>,

    /// Retries for requests to the ACME provider.
    pub retry: RetryPolicy,

    /// Polling of authorizations and the order.
    pub poll: PollPolicy,

    /// Retries for calls into the DNS provider.
    pub provider_retry: ProviderRetry,

    /// Public resolver check after publishing a record.
    pub propagation: PropagationConfig,

    /// Overall limit for one order, from account lookup to saved bundle.
    #[serde(with = "crate::duration::secs")]
    pub order_timeout: Duration,

    /// Limit for a single HTTP request to the ACME provider.
    #[serde(with = "crate::duration::secs")]
    pub http_timeout: Duration,

    /// Renew a stored certificate expiring within this many days.
    pub renewal_days: i64,

    /// Issue a new certificate even if the stored one is still current.
    pub force: bool,
}

impl Default for IssueConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            emails: Vec::new(),
            cert_dir: PathBuf::from("certs"),
            staging: false,
            directory_url: None,
            accept_terms: true,
            account_key: None,
            account_record: None,
            account_key_type: AccountKeyType::default(),
            root_certificates: Vec::new(),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            provider_retry: ProviderRetry::default(),
            propagation: PropagationConfig::default(),
            order_timeout: Duration::from_secs(600),
            http_timeout: Duration::from_secs(30),
            renewal_days: DEFAULT_RENEWAL_DAYS,
            force: false,
        }
    }
}

impl IssueConfig {
    /// Configuration for `domains` with a single contact address.
    pub fn new<D, S>(domains: D, email: &str, cert_dir: impl Into<PathBuf>, staging: bool) -> Self
    where
        D: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            emails: vec![email.to_owned()],
            cert_dir: cert_dir.into(),
            staging,
            ..Default::default()
        }
    }

    /// The ACME directory to use.
    ///
    /// An explicit `directory_url` wins, otherwise `staging` picks between
    /// the Let's Encrypt environments.
    pub fn directory(&self) -> Result<Url, IssueError> {
        if let Some(url) = &self.directory_url {
            return Ok(url.clone());
        }
        let url = if self.staging {
            provider::LETSENCRYPT_STAGING
        } else {
            provider::LETSENCRYPT
        };
        url.parse()
            .map_err(|_| IssueError::Directory(BuilderError::Url))
    }

    /// Where the account key and record are kept.
    pub fn account_storage(&self) -> AccountStorage {
        let mut storage = AccountStorage::in_directory(&self.cert_dir);
        if let Some(path) = &self.account_key {
            storage.key_path = path.clone();
        }
        if let Some(path) = &self.account_record {
            storage.record_path = path.clone();
        }
        storage.kind = self.account_key_type.into();
        storage
    }

    /// Requested names, normalized and without duplicates, in request order.
    fn requested_domains(&self) -> Result<Vec<String>, IssueError> {
        let mut domains: Vec<String> = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let domain = Identifier::dns(domain).value().to_owned();
            if !domain.is_empty() && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        if domains.is_empty() {
            return Err(IssueError::NoDomains);
        }
        Ok(domains)
    }

    async fn provider(&self) -> Result<Provider, IssueError> {
        let url = self.directory()?;
        let mut builder = Provider::build()
            .directory_url(url)
            .timeout(self.http_timeout)
            .connect_timeout(self.http_timeout)
            .retry_policy(self.retry.clone());

        if self.directory_url.is_none() {
            builder = builder.name(if self.staging {
                "Let's Encrypt (staging)"
            } else {
                "Let's Encrypt"
            });
        }

        for path in &self.root_certificates {
            let pem = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|error| IssueError::Directory(BuilderError::Client(error)))?;
            builder = builder.add_root_certificate(certificate);
        }

        Ok(builder.build().await?)
    }
}

/// Issue a certificate for `config.domains`, or return the stored one if it
/// is not yet due for renewal.
///
/// Resolves challenge records against the public resolvers named in
/// `config.propagation`.
pub async fn issue_or_renew(
    config: &IssueConfig,
    provider: Arc<dyn DnsProvider>,
    cancel: CancellationToken,
) -> Result<CertificateBundle, IssueError> {
    let propagation = PropagationChecker::new(config.propagation.clone());
    issue_or_renew_with(config, provider, &propagation, cancel).await
}

/// [`issue_or_renew`], with a caller-supplied propagation check.
#[tracing::instrument(skip_all, fields(domains = ?config.domains))]
pub async fn issue_or_renew_with(
    config: &IssueConfig,
    provider: Arc<dyn DnsProvider>,
    propagation: &PropagationChecker,
    cancel: CancellationToken,
) -> Result<CertificateBundle, IssueError> {
    let domains = config.requested_domains()?;
    let store = CertificateStore::new(&config.cert_dir);

    if !config.force {
        if let Some(bundle) = current_bundle(&store, &domains, config.renewal_days).await {
            tracing::info!(not_after = %bundle.not_after, "Stored certificate is current");
            return Ok(bundle);
        }
    }

    tracing::info!(dns = %provider.name(), "Issuing certificate");
    let fulfiller = DnsChallengeFulfiller::new(provider, config.provider_retry.clone());

    let outcome = tokio::select! {
        result = issue(config, &domains, &store, &fulfiller, propagation) => result,
        _ = cancel.cancelled() => Err(IssueError::Cancelled),
        _ = tokio::time::sleep(config.order_timeout) => Err(IssueError::OrderTimeout),
    };

    fulfiller.withdraw_all().await;

    match &outcome {
        Ok(bundle) => {
            tracing::info!(not_after = %bundle.not_after, path = ?bundle.path, "Certificate issued")
        }
        Err(error) => tracing::warn!(%error, "Certificate issuance failed"),
    }
    outcome
}

async fn current_bundle(
    store: &CertificateStore,
    domains: &[String],
    renewal_days: i64,
) -> Option<CertificateBundle> {
    let stored = match store.load(&domains[0]).await {
        Ok(stored) => stored?,
        Err(error) => {
            tracing::warn!(%error, "Ignoring unreadable stored certificate");
            return None;
        }
    };

    if !stored.covers(domains) {
        tracing::debug!(stored = ?stored.domains, "Stored certificate names differ from request");
        return None;
    }
    if stored.needs_renewal(Utc::now(), chrono::Duration::days(renewal_days)) {
        tracing::info!(not_after = %stored.not_after, "Stored certificate is due for renewal");
        return None;
    }

    match store.load_bundle(domains).await {
        Ok(bundle) => bundle,
        Err(error) => {
            tracing::warn!(%error, "Ignoring unreadable stored bundle");
            None
        }
    }
}

async fn issue(
    config: &IssueConfig,
    domains: &[String],
    store: &CertificateStore,
    fulfiller: &DnsChallengeFulfiller,
    propagation: &PropagationChecker,
) -> Result<CertificateBundle, IssueError> {
    let provider = config.provider().await?;
    let account = ensure_account(
        &provider,
        &config.emails,
        config.accept_terms,
        &config.account_storage(),
    )
    .await?;

    let mut order = domains
        .iter()
        .fold(account.order(), |order, domain| order.dns(domain))
        .create()
        .await?;
    tracing::info!(url = %order.url(), status = ?order.status(), "Created order");

    let key = account.key();
    let authorizations = order.authorizations().await?;
    let outcomes = futures::future::join_all(authorizations.into_iter().map(|authorization| {
        authorize(authorization, &key, fulfiller, propagation, &config.poll)
    }))
    .await;
    outcomes.into_iter().collect::<Result<Vec<()>, IssueError>>()?;

    order.refresh().await?;
    order.wait_ready(&config.poll).await?;

    let certificate_key = match store.certificate_key(&domains[0]).await {
        Some(key) => {
            tracing::debug!("Re-using stored certificate key");
            key
        }
        None => CertificateKey::random(),
    };

    let mut csr = CertificateSigningRequest::new();
    for domain in domains {
        csr.push(Identifier::dns(domain));
    }
    let csr = csr.sign(&certificate_key)?;

    let chain = order.finalize_and_download(csr, &config.poll).await?;

    let found = cert::certificate_names(chain.leaf())
        .map_err(|error| StoreError::certificate(Path::new("<downloaded certificate>"), error))?;
    let expected = order.names();
    if found != expected {
        return Err(IssueError::CertificateMismatch { expected, found });
    }

    let mut bundle = CertificateBundle::new(domains.to_vec(), &chain, &certificate_key)?;
    bundle.path = Some(store.save(&bundle).await?);
    Ok(bundle)
}

/// Complete the `dns-01` challenge for one authorization.
///
/// The record published here is withdrawn once the authorization is
/// final, whatever the outcome.
async fn authorize(
    mut authorization: Authorization<'_>,
    key: &SigningKey,
    fulfiller: &DnsChallengeFulfiller,
    propagation: &PropagationChecker,
    poll: &PollPolicy,
) -> Result<(), IssueError> {
    let domain = authorization.domain();
    match authorization.status() {
        AuthorizationStatus::Valid => {
            tracing::debug!(%domain, "Authorization is already valid");
            return Ok(());
        }
        AuthorizationStatus::Pending => {}
        status => return Err(invalid(&authorization, status)),
    }

    let challenge = authorization
        .dns01()
        .ok_or_else(|| IssueError::UnsupportedChallenge {
            domain: domain.clone(),
        })?;

    let record = fulfiller.publish(&domain, &challenge.digest(key)).await?;

    let outcome = async {
        propagation.wait_for(&record.fqdn, &record.value).await;
        authorization.ready(&challenge).await?;

        let status = tokio::time::timeout(poll.authorization_timeout, authorization.wait(poll))
            .await
            .map_err(|_| IssueError::ValidationTimeout {
                domain: domain.clone(),
            })??;

        match status {
            AuthorizationStatus::Valid => {
                tracing::info!(%domain, "Authorization is valid");
                Ok::<(), IssueError>(())
            }
            status => Err(invalid(&authorization, status)),
        }
    }
    .await;

    if let Err(error) = fulfiller.withdraw(&record).await {
        tracing::warn!(fqdn = %record.fqdn, %error, "Failed to withdraw challenge record");
    }
    outcome
}

fn invalid(authorization: &Authorization<'_>, status: AuthorizationStatus) -> IssueError {
    IssueError::AuthorizationInvalid {
        domain: authorization.domain(),
        detail: authorization
            .data()
            .failure_detail()
            .unwrap_or_else(|| format!("authorization is {status:?}")),
    }
}
