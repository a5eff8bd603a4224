//! # Account creation and management
//!
//! Accounts are identified by their signing key for ACME.

use std::collections::BTreeSet;

use serde::{ser, Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Url;

/// A contact address which could not be used.
#[derive(Debug, Error)]
#[error("invalid contact email {address:?}: {reason}")]
pub struct ContactError {
    address: String,
    reason: &'static str,
}

impl ContactError {
    fn new(address: &str, reason: &'static str) -> Self {
        Self {
            address: address.to_owned(),
            reason,
        }
    }

    /// The rejected address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// A set of contact addresses to assosciate with an account.
///
/// Contacts are kept in lexicographic order.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Contacts(BTreeSet<Url>);

impl Contacts {
    /// Create a new, empty set of contacts.
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a url for contact.
    pub fn add_contact_url(&mut self, url: Url) {
        self.0.insert(url);
    }

    /// Add an email address (as a mailto: url) for contact.
    ///
    /// Only a basic shape check is done here; the ACME provider has the
    /// final word through `invalidContact`.
    pub fn add_contact_email(&mut self, email: &str) -> Result<(), ContactError> {
        let email = email.trim();
        let Some((local, domain)) = email.split_once('@') else {
            return Err(ContactError::new(email, "missing '@'"));
        };
        if local.is_empty() || domain.is_empty() {
            return Err(ContactError::new(email, "empty local part or domain"));
        }
        if domain.contains('@') || !domain.contains('.') || domain.starts_with('.') {
            return Err(ContactError::new(email, "malformed domain"));
        }
        if email.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(ContactError::new(email, "unexpected characters"));
        }

        let url: Url = format!("mailto:{email}")
            .parse()
            .map_err(|_| ContactError::new(email, "not a valid mailto URL"))?;
        self.add_contact_url(url);
        Ok(())
    }

    /// Number of contacts in this datastructrue.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is this set of contacts empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate through the contact URLs in this set.
    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.0.iter()
    }
}

impl ser::Serialize for Contacts {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.0.iter().map(|url| url.as_str()))
    }
}

/// Account information provided by an ACME service provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// The status of the account - valid, deactivated, or revoked.
    pub status: AccountStatus,

    /// A list of contact URIs for this account.
    #[serde(default)]
    pub contact: Contacts,

    /// If the terms of service were agreed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    /// The url to fetch a list of orders from the ACME provider.
    #[serde(default)]
    pub orders: Option<Url>,
}

/// # Account Status
///
/// From RFC 8555:
///
///  Account objects are created in the "valid" state, since no further
///    action is required to create an account after a successful newAccount
///    request.  If the account is deactivated by the client or revoked by
///    the server, it moves to the corresponding state.
///
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Account objects are created in the valid state.
    Valid,

    /// Accounts can be deactivated by the client.
    Deactivated,

    /// The server has revoked the account.
    Revoked,
}

/// Request payload for creating a new account
#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccount {
    /// List of contact URIs
    #[serde(skip_serializing_if = "Contacts::is_empty")]
    pub contact: Contacts,

    /// Has the user agreed to the terms of service?
    ///
    /// This field should only be set to `true` if the user has actually had to
    /// take some action to agree to the terms of service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    /// Ask the ACME provider to only return an account if it already exists,
    /// don't create a new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}
