//! The ACME directory, the entry point to a provider.

use serde::{Deserialize, Serialize};

use crate::protocol::Url;

/// Directories are the single source required to configure an ACME client
/// for use with a specific provider. They can be fetched as JSON from an
/// advertised directory URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// URL used to fetch a new Nonce via a HEAD request
    pub new_nonce: Url,

    /// URL to create a new account
    pub new_account: Url,

    /// URL to create a new certificate order
    pub new_order: Url,

    /// (optional) URL to start a new pre-authorization
    #[serde(default)]
    pub new_authz: Option<Url>,

    /// URL to revoke an existing certificate
    pub revoke_cert: Url,

    /// URL to change the account signing key
    pub key_change: Url,

    /// Additional metadata
    #[serde(default)]
    pub meta: Option<Metadata>,
}

impl Directory {
    /// The terms of service which must be agreed to before registering
    /// an account, if the provider publishes any.
    pub fn terms_of_service(&self) -> Option<&Url> {
        self.meta.as_ref()?.terms_of_service.as_ref()
    }
}

/// Optional metadata published in the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// A URL to find and display terms of service for the ACME server
    #[serde(default)]
    pub terms_of_service: Option<Url>,

    /// A URL for the default website of the ACME server
    #[serde(default)]
    pub website: Option<Url>,

    /// Issuer domain names the server expects in CAA records.
    #[serde(default)]
    pub caa_identities: Vec<String>,

    /// Whether an external account registration is required to register with this provider.
    #[serde(default)]
    pub external_account_required: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_directory() {
        let response = crate::response!("directory.http");

        let directory: Directory = serde_json::from_str(response.body()).unwrap();
        assert_eq!(
            directory.new_account,
            "https://ca.test/acme/new-account".parse().unwrap()
        );
        assert_eq!(
            directory.terms_of_service().map(|u| u.as_str()),
            Some("https://ca.test/terms/v1")
        );
        assert_eq!(directory.meta.unwrap().caa_identities, vec!["ca.test"]);
    }

    #[test]
    fn directory_without_meta() {
        let directory: Directory = serde_json::from_value(serde_json::json!({
            "newNonce": "https://ca.test/acme/new-nonce",
            "newAccount": "https://ca.test/acme/new-account",
            "newOrder": "https://ca.test/acme/new-order",
            "revokeCert": "https://ca.test/acme/revoke-cert",
            "keyChange": "https://ca.test/acme/key-change"
        }))
        .unwrap();
        assert!(directory.terms_of_service().is_none());
        assert!(directory.new_authz.is_none());
    }
}
