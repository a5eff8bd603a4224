//! # Authorizations for identifiers in an order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::challenges::{Challenge, Dns01Challenge};
use super::identifier::Identifier;

/// Authorization of an ACME Account to represent a sepcific Identifier
/// for certificates.
///
///   An ACME authorization object represents a server’s authorization for
///   an account to represent an identifier.  In addition to the
///   identifier, an authorization includes several metadata fields, such
///   as the status of the authorization (e.g., "pending", "valid", or
///   "revoked") and which challenges were used to validate possession of
///   the identifier.
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    /// The identifier that the account is authorized to represent.
    pub identifier: Identifier,

    /// The status of this authorization
    pub status: AuthorizationStatus,

    /// The timestamp after which the serve will consider this authorization
    /// invalid
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,

    /// For pending authorizations, the challenges that the client can fulfill
    /// in order to prove possession of the identifier. For valid
    /// authorizations, the challenge that was validated. For invalid
    /// authorizations, the challenge that was attempted and failed.
    pub challenges: Vec<Challenge>,

    /// Indicates that this authorization corresponds to an order
    /// which requested an indentifier with a DNS wildcard.
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// The name as it appears in the order.
    ///
    /// Wildcard authorizations carry the base domain as their identifier,
    /// so the `*.` label is restored here.
    pub fn domain(&self) -> String {
        if self.wildcard && !self.identifier.is_wildcard() {
            format!("*.{}", self.identifier.value())
        } else {
            self.identifier.value().to_owned()
        }
    }

    /// The `dns-01` challenge offered for this authorization, if any.
    pub fn dns01(&self) -> Option<&Dns01Challenge> {
        self.challenges.iter().find_map(Challenge::dns01)
    }

    /// The most specific error detail reported by a failed challenge.
    pub fn failure_detail(&self) -> Option<String> {
        self.challenges
            .iter()
            .find_map(|challenge| challenge.error())
            .map(|error| error.message().to_owned())
    }
}

/// Status of an individual ACME authorization for an [`Identifier`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    /// The ACME server is waiting on the client to attempt authorization
    Pending,

    /// The ACME server is satisfied tha the client owns the [`Identifier`] in question.
    Valid,

    /// A challenge failed or encountered an error, and this authorization can't be recovered.
    Invalid,

    /// The ACME server has deactivated this authorization.
    Deactivated,

    /// The authorization is too old, and has expired.
    Expired,

    /// The authorization was revoked by the client.
    Revoked,
}

impl AuthorizationStatus {
    /// Will this authorization never change status again?
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}
