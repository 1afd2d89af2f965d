//! Credential Store (spec.md §4.2).

pub mod token;

pub use token::{AccessToken, CredentialStore};
