//! # Data structures exchanged with an ACME provider
//!
//! These types follow the JSON objects defined in [RFC 8555][]. They are
//! plain data: requests are built here and sent by [`crate::service`].
//!
//! [RFC 8555]: https://datatracker.ietf.org/doc/html/rfc8555
#![deny(missing_docs)]

pub mod account;
pub mod authorizations;
pub mod challenges;
pub mod directory;
pub mod identifier;
pub mod orders;

pub use account::Account;
pub use authorizations::Authorization;
pub use challenges::Challenge;
pub use directory::Directory;
pub use identifier::Identifier;
pub use orders::Order;
