//! Quota-Harvester: a credential-pooled client for quota-limited REST APIs
//!
//! This crate spreads calls over a pool of API credentials, tracks each
//! credential's per-endpoint rate limits, and builds two harvesting engines
//! on top of that pool: a resumable follower crawler persisted in SQLite and
//! a bulk id fetcher backed by an on-disk artifact cache.

pub mod api;
pub mod bulk;
pub mod config;
pub mod crawl;
pub mod credentials;
pub mod dispatch;
pub mod output;
pub mod shutdown;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Quota-Harvester operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("No worker available for {endpoint}")]
    NoWorkerAvailable { endpoint: String },

    #[error("Worker {worker} is throttled on {endpoint}")]
    Throttled { worker: String, endpoint: String },

    #[error("Upstream rejected {endpoint} with HTTP {status}: {message}")]
    UpstreamRejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Not authorized to read user {user_id} after {attempts} attempts")]
    AuthorizationFailed { user_id: i64, attempts: u32 },

    #[error("Malformed response from {endpoint}: {message}")]
    MalformedResponse { endpoint: String, message: String },

    #[error("Too many hangups within {window_secs}s")]
    TooManyHangups { window_secs: u64 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential store error: {0}")]
    Credentials(#[from] credentials::CredentialError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// HTTP status carried by an upstream rejection, if any
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Quota-Harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

// Re-export commonly used types
pub use api::{ApiResponse, CallArgs, Endpoint};
pub use config::Config;
pub use credentials::{Credential, CredentialSource};
pub use dispatch::{Dispatcher, StreamDispatcher};
pub use state::{EntryState, RateLimitEntry, RateLimitTable};
