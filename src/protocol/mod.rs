//! # ACME JWS implementation and ACME request types.
//!
//! Every authenticated ACME request is a JWS, signed by the account key.
//! This module provides the implementation of that protocol, the
//! deserialization of the corresponding responses, and a [`Client`] type
//! which tracks the correct nonce through a series of requests.
#![deny(unsafe_code)]
#![deny(missing_docs)]

use std::ops::Deref;
use std::str::FromStr;

mod base64;
pub mod client;
pub mod errors;
pub mod jose;
pub mod request;
pub mod response;

pub use base64::Base64Data;
pub use base64::Base64JSON;
pub use client::{AcmeClient, Client, RetryPolicy};
pub use errors::AcmeError;

#[doc(no_inline)]
pub use request::Request;
#[doc(no_inline)]
pub use response::Response;
use serde::{Deserialize, Serialize};

/// An ACME resource URL.
///
/// Debug output is the plain URL string, which keeps request logs short.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Url(url::Url);

impl Url {
    /// The URL as a string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for Url {
    type Target = url::Url;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<url::Url> for Url {
    fn from(value: url::Url) -> Self {
        Url(value)
    }
}

impl From<Url> for url::Url {
    fn from(value: Url) -> Self {
        value.0
    }
}

impl AsRef<str> for Url {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Url({:?})", self.as_str())
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Url {
    type Err = url::ParseError;

    fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
        s.parse().map(Url)
    }
}
