//! An ACME service provider account
//!
//! [`ensure_account`] is the usual entry point: it loads or creates the
//! account key, and registers it with the provider or re-uses the account
//! recorded by a previous run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{KeyError, SignatureKind, SigningKey};
use crate::protocol::errors::{AcmeErrorCode, AcmeErrorDocument};
use crate::protocol::jose::AccountKeyIdentifier;
use crate::protocol::{request::Key, AcmeError, Request, Response, Url};
use crate::schema::{
    self,
    account::{AccountStatus, ContactError, Contacts, CreateAccount},
    directory::Directory,
};

use super::{order::OrderBuilder, Provider};

/// Errors which prevent using an ACME account.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The provider publishes terms of service which were not accepted.
    #[error("the ACME provider requires agreement to its terms of service ({0})")]
    TermsOfServiceNotAccepted(Url),

    /// A contact address was rejected before contacting the provider.
    #[error(transparent)]
    Contact(#[from] ContactError),

    /// The provider rejected the account or its contacts.
    #[error("the ACME provider rejected the account: {0}")]
    Rejected(AcmeErrorDocument),

    /// The account exists but can no longer be used.
    #[error("the ACME account is {0:?}")]
    Status(AccountStatus),

    /// The account key could not be loaded, generated or saved.
    #[error("account key: {0}")]
    Key(#[from] KeyError),

    /// The account record could not be saved.
    #[error("account record {}: {source}", path.display())]
    Record {
        /// The record path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Any other protocol or transport failure.
    #[error(transparent)]
    Protocol(AcmeError),
}

impl From<AcmeError> for AccountError {
    fn from(error: AcmeError) -> Self {
        match error {
            AcmeError::Acme(document)
                if matches!(
                    document.code(),
                    AcmeErrorCode::InvalidContact
                        | AcmeErrorCode::UnsupportedContact
                        | AcmeErrorCode::AccountDoesNotExist
                ) =>
            {
                AccountError::Rejected(document)
            }
            error => AccountError::Protocol(error),
        }
    }
}

/// An account with an ACME provider
///
/// Accounts are identified by their signing key.
#[derive(Debug, Clone)]
pub struct Account {
    provider: Provider,
    key: Arc<SigningKey>,
    data: schema::Account,
    url: Url,
}

impl Account {
    fn new(provider: Provider, key: Arc<SigningKey>, data: schema::Account, url: Url) -> Self {
        Self {
            provider,
            key,
            data,
            url,
        }
    }

    /// Fetch an existing account by URL with a POST-as-GET request.
    pub async fn fetch(
        provider: Provider,
        key: Arc<SigningKey>,
        url: Url,
    ) -> Result<Self, AcmeError> {
        let request_key = Key::from((key.clone(), AccountKeyIdentifier::from(url.clone())));
        let response: Response<schema::Account> = provider
            .client()
            .execute(Request::get(url.clone(), request_key))
            .await?;
        Ok(Account::new(provider, key, response.into_inner(), url))
    }

    #[inline]
    pub(crate) fn client(&self) -> &super::client::Client {
        self.provider.client()
    }

    #[inline]
    pub(crate) fn directory(&self) -> &Directory {
        self.provider.directory()
    }

    /// Refresh this account's data from the ACME service
    pub async fn refresh(&mut self) -> Result<(), AcmeError> {
        let response: Response<schema::Account> = self
            .client()
            .execute(Request::get(self.url().clone(), self.request_key()))
            .await?;

        self.data = response.into_inner();
        Ok(())
    }

    /// The raw [`crate::schema::Account`] associated with this account
    pub fn data(&self) -> &schema::Account {
        &self.data
    }

    /// Signing key which identifies this account
    pub fn key(&self) -> Arc<SigningKey> {
        self.key.clone()
    }

    /// Identifying URL for this account
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The provider this account belongs to.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Key used for signing requests, including identifier
    pub(crate) fn request_key(&self) -> Key {
        Key::from((self.key(), AccountKeyIdentifier::from(self.url.clone())))
    }

    /// Create a new order for a certificate
    pub fn order(&self) -> OrderBuilder<'_> {
        OrderBuilder::new(self)
    }
}

/// Manage a request for a new or existing ACME account
/// from an ACME provider.
#[derive(Debug)]
pub struct AccountBuilder {
    contact: Contacts,
    terms_of_service_agreed: Option<bool>,
    only_return_existing: Option<bool>,
    key: Arc<SigningKey>,
    provider: Provider,
}

impl AccountBuilder {
    pub(crate) fn new(provider: Provider, key: Arc<SigningKey>) -> Self {
        AccountBuilder {
            contact: Default::default(),
            terms_of_service_agreed: None,
            only_return_existing: None,
            key,
            provider,
        }
    }

    /// Tell the provider that the user has taken action to agree to the terms of service.
    pub fn agree_to_terms_of_service(mut self) -> Self {
        self.terms_of_service_agreed = Some(true);
        self
    }

    /// Replace the contacts for the account.
    pub fn contacts(mut self, contacts: Contacts) -> Self {
        self.contact = contacts;
        self
    }

    /// Add a contact email address to the account, which will be converted to a mailto: URL.
    pub fn add_contact_email(mut self, email: &str) -> Result<Self, ContactError> {
        self.contact.add_contact_email(email)?;
        Ok(self)
    }

    /// Require that the account already exists.
    pub fn must_exist(mut self) -> Self {
        self.only_return_existing = Some(true);
        self
    }

    /// Create a new account with the ACME provider.
    ///
    /// The provider returns the existing account when one is already
    /// registered for this key.
    pub async fn create(self) -> Result<Account, AcmeError> {
        let url = self.provider.directory().new_account.clone();
        let payload = CreateAccount {
            contact: self.contact,
            terms_of_service_agreed: self.terms_of_service_agreed,
            only_return_existing: self.only_return_existing,
        };

        let account: Response<crate::schema::Account> = self
            .provider
            .client()
            .execute(Request::post(payload, url, self.key.clone()))
            .await?;

        let account_url = account
            .location()
            .ok_or(AcmeError::MissingData("account id URL"))?;

        tracing::debug!(url = %account_url, status = ?account.payload().status, "Account registered");
        Ok(Account::new(
            self.provider,
            self.key,
            account.into_inner(),
            account_url,
        ))
    }

    /// Get an existing account.
    ///
    /// Uses `only_return_existing`, overriding the value set by [`AccountBuilder::must_exist`].
    pub async fn get(mut self) -> Result<Account, AcmeError> {
        self.only_return_existing = Some(true);
        self.create().await
    }
}

/// The account details persisted between runs, as `account.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// The account URL (`kid`).
    pub url: Url,
    /// The directory URL the account was registered with.
    pub directory: Url,
    /// Contact URLs sent at registration.
    #[serde(default)]
    pub contacts: Vec<String>,
    /// JWK thumbprint of the account key the account was registered with.
    #[serde(default)]
    pub thumbprint: Option<String>,
}

impl AccountRecord {
    /// Read a record, returning `None` if it is missing or unreadable.
    pub async fn load(path: &Path) -> Option<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(path = %path.display(), "Unable to read account record: {error}");
                return None;
            }
        };
        serde_json::from_slice(&data)
            .inspect_err(|error| {
                tracing::warn!(path = %path.display(), "Ignoring malformed account record: {error}");
            })
            .ok()
    }

    /// Write this record atomically.
    pub async fn save(&self, path: &Path) -> Result<(), AccountError> {
        let record_error = |source| AccountError::Record {
            path: path.to_owned(),
            source,
        };
        let data = serde_json::to_vec_pretty(self).map_err(|error| record_error(error.into()))?;
        crate::store::write_atomic(path, &data, None)
            .await
            .map_err(record_error)
    }
}

/// Where the account key and record live, and how a new key is generated.
#[derive(Debug, Clone)]
pub struct AccountStorage {
    /// PKCS#8 PEM account key.
    pub key_path: PathBuf,
    /// JSON [`AccountRecord`].
    pub record_path: PathBuf,
    /// Algorithm for a newly generated key.
    pub kind: SignatureKind,
}

impl AccountStorage {
    /// `account.key` and `account.json` inside `dir`.
    pub fn in_directory(dir: &Path) -> Self {
        Self {
            key_path: dir.join("account.key"),
            record_path: dir.join("account.json"),
            kind: SignatureKind::default(),
        }
    }
}

/// Register or re-use the ACME account for the stored key.
///
/// * The key at `storage.key_path` is loaded, or generated and saved.
/// * An [`AccountRecord`] for the same directory and the same key is re-used
///   with a POST-as-GET; otherwise `newAccount` is called, which returns the
///   existing account for a known key.
/// * A recorded account which the provider no longer accepts is registered
///   again with `newAccount`.
/// * The record is saved after every success.
pub async fn ensure_account(
    provider: &Provider,
    emails: &[String],
    terms_accepted: bool,
    storage: &AccountStorage,
) -> Result<Account, AccountError> {
    let mut contacts = Contacts::new();
    for email in emails {
        contacts.add_contact_email(email)?;
    }

    if let Some(terms) = provider.directory().terms_of_service() {
        if !terms_accepted {
            return Err(AccountError::TermsOfServiceNotAccepted(terms.clone()));
        }
    }

    let (key, generated) = load_or_generate_key(storage).await?;
    let key = Arc::new(key);
    let thumbprint = key.as_jwk().thumbprint();

    let record = if generated {
        None
    } else {
        AccountRecord::load(&storage.record_path)
            .await
            .filter(|record| record.matches(provider.url(), &thumbprint))
    };

    let account = match record {
        Some(record) => {
            tracing::debug!(url = %record.url, "Re-using recorded account");
            match Account::fetch(provider.clone(), key.clone(), record.url).await {
                Ok(account) => account,
                Err(AcmeError::Acme(document)) if is_stale_record(&document) => {
                    tracing::info!(%document, "Recorded account was refused, registering again");
                    register(provider, key, &contacts, terms_accepted).await?
                }
                Err(error) => return Err(error.into()),
            }
        }
        None => register(provider, key, &contacts, terms_accepted).await?,
    };

    match account.data().status {
        AccountStatus::Valid => {}
        status => return Err(AccountError::Status(status)),
    }

    AccountRecord {
        url: account.url().clone(),
        directory: provider.url().clone(),
        contacts: contacts.iter().map(|c| c.to_string()).collect(),
        thumbprint: Some(thumbprint),
    }
    .save(&storage.record_path)
    .await?;

    tracing::info!(url = %account.url(), "Using ACME account");
    Ok(account)
}

async fn register(
    provider: &Provider,
    key: Arc<SigningKey>,
    contacts: &Contacts,
    terms_accepted: bool,
) -> Result<Account, AcmeError> {
    let mut builder = provider.account(key).contacts(contacts.clone());
    if terms_accepted {
        builder = builder.agree_to_terms_of_service();
    }
    builder.create().await
}

/// Problems which mean the recorded account URL does not belong to this key.
fn is_stale_record(document: &AcmeErrorDocument) -> bool {
    matches!(
        document.code(),
        AcmeErrorCode::AccountDoesNotExist | AcmeErrorCode::Unauthorized | AcmeErrorCode::Malformed
    )
}

impl AccountRecord {
    /// Does this record describe the account of `thumbprint` at `directory`?
    fn matches(&self, directory: &Url, thumbprint: &str) -> bool {
        if &self.directory != directory {
            tracing::debug!(directory = %self.directory, "Account record belongs to another directory");
            return false;
        }
        match &self.thumbprint {
            Some(recorded) if recorded != thumbprint => {
                tracing::debug!("Account record belongs to another key");
                false
            }
            _ => true,
        }
    }
}

/// Load the account key, or generate and save one. The flag is set for a new key.
async fn load_or_generate_key(storage: &AccountStorage) -> Result<(SigningKey, bool), KeyError> {
    match tokio::fs::try_exists(&storage.key_path).await {
        Ok(true) => {
            tracing::debug!(path = %storage.key_path.display(), "Loading account key");
            Ok((SigningKey::load(&storage.key_path).await?, false))
        }
        _ => {
            tracing::info!(path = %storage.key_path.display(), "Generating account key");
            let key = storage.kind.random()?;
            key.save(&storage.key_path).await?;
            Ok((key, true))
        }
    }
}
