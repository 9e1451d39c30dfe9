//! HTTP surface: the authenticated client and the object requester.
//!
//! [`auth`] turns the external credential helper into cached `Authorization`
//! headers; [`requester`] speaks the `/gvfs/config` and `/gvfs/objects`
//! endpoints with retry, backoff, and one-shot credential refresh.

pub mod auth;
pub mod requester;

pub use auth::{Credential, CredentialManager, CredentialSource, GitCredentialHelper};
pub use requester::{ObjectRequester, RequesterOptions};
