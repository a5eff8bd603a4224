//! Identifiers which a certificate can be issued for.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cert::RequestedSubjectName;

const WILDCARD_PREFIX: &str = "*.";

/// An identifier in an ACME order.
///
/// Only DNS identifiers are supported. Wildcard names keep their `*.`
/// prefix in orders; authorizations carry the base name and a
/// `wildcard` flag instead.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Identifier {
    /// A DNS name, such as `www.example.com` or `*.example.com`.
    Dns {
        /// The hostname.
        value: String,
    },
}

impl Identifier {
    /// Create a DNS identifier, normalized to lowercase without a trailing dot.
    pub fn dns<S: AsRef<str>>(hostname: S) -> Identifier {
        let value = hostname.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
        Self::Dns { value }
    }

    /// The identifier's name.
    pub fn value(&self) -> &str {
        match self {
            Identifier::Dns { value } => value,
        }
    }

    /// Is this a wildcard name?
    pub fn is_wildcard(&self) -> bool {
        self.value().starts_with(WILDCARD_PREFIX)
    }

    /// The name with any wildcard label removed.
    ///
    /// This is the name that is validated for a DNS-01 challenge.
    pub fn base_domain(&self) -> &str {
        let value = self.value();
        value.strip_prefix(WILDCARD_PREFIX).unwrap_or(value)
    }
}

impl From<Identifier> for RequestedSubjectName {
    fn from(value: Identifier) -> Self {
        match value {
            Identifier::Dns { value } => RequestedSubjectName::Dns(value),
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns { value } => f.debug_tuple("Identifier::DNS").field(value).finish(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_base_domain() {
        let id = Identifier::dns("*.Example.com.");
        assert_eq!(id.value(), "*.example.com");
        assert!(id.is_wildcard());
        assert_eq!(id.base_domain(), "example.com");

        let apex = Identifier::dns("example.com");
        assert!(!apex.is_wildcard());
        assert_eq!(apex.base_domain(), "example.com");
    }

    #[test]
    fn serialize_identifier() {
        let id = Identifier::dns("*.example.com");
        assert_eq!(
            serde_json::to_value(&id).unwrap(),
            serde_json::json!({"type": "dns", "value": "*.example.com"})
        );
    }
}
