//! Credential storage
//!
//! The dispatcher only needs to iterate credentials; adding and removing
//! them is a maintenance concern of the `credentials` command. Storage is
//! kept behind the [`CredentialSource`] trait so the flat JSON-lines file can
//! be swapped for any other durable store.

mod store;

pub use store::{JsonLinesCredentialStore, MemoryCredentialStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// OAuth 1.0a credential of one API account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Label of the account the tokens belong to
    pub user: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token_key: String,
    pub token_secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("token_key", &self.token_key)
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

/// Matches credentials on any subset of their fields
///
/// An empty filter matches every credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialFilter {
    pub user: Option<String>,
    pub consumer_key: Option<String>,
    pub token_key: Option<String>,
}

impl CredentialFilter {
    pub fn by_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, credential: &Credential) -> bool {
        fn field_matches(wanted: &Option<String>, actual: &str) -> bool {
            wanted.as_deref().map_or(true, |w| w == actual)
        }

        field_matches(&self.user, &credential.user)
            && field_matches(&self.consumer_key, &credential.consumer_key)
            && field_matches(&self.token_key, &credential.token_key)
    }
}

/// Errors that can occur while reading or writing credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed credential on line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Durable source of API credentials
pub trait CredentialSource {
    /// Returns every stored credential in insertion order
    fn iter_credentials(&self) -> CredentialResult<Vec<Credential>>;

    /// Stores a credential unless one with the same user label exists
    ///
    /// Returns whether the credential was added.
    fn add(&mut self, credential: Credential) -> CredentialResult<bool>;

    /// Removes every credential matching the filter
    ///
    /// Returns how many were removed.
    fn remove(&mut self, filter: &CredentialFilter) -> CredentialResult<usize>;
}
