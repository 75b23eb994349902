use serde::Deserialize;

/// Main configuration structure for Quota-Harvester
///
/// Every section is optional; a missing section takes its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub credentials: CredentialsConfig,
    pub dispatcher: DispatcherConfig,
    pub crawl: CrawlConfig,
    pub bulk: BulkConfig,
    pub stream: StreamConfig,
}

/// Upstream API location and HTTP client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the REST API, e.g. `https://api.twitter.com/1.1/`
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Base URL of the streaming API
    #[serde(rename = "stream-url")]
    pub stream_url: String,

    /// Timeout of one REST request (seconds)
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// User agent sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitter.com/1.1/".to_string(),
            stream_url: "https://stream.twitter.com/1.1/".to_string(),
            request_timeout_secs: 30,
            user_agent: format!("QuotaHarvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Credential store location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Path to the JSON-lines credential file
    pub path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: "credentials.jsonl".to_string(),
        }
    }
}

/// Worker selection and retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Block until a worker is eligible instead of failing
    pub wait: bool,

    /// Sleep used when every worker is mid-flight (seconds)
    #[serde(rename = "busy-fallback-secs")]
    pub busy_fallback_secs: u64,

    /// Sleep before retrying after a connection error (seconds)
    #[serde(rename = "transport-backoff-secs")]
    pub transport_backoff_secs: u64,

    /// Give up after this many consecutive connection errors (unset = never)
    #[serde(rename = "max-transport-retries")]
    pub max_transport_retries: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wait: true,
            busy_fallback_secs: 5,
            transport_backoff_secs: 5,
            max_transport_retries: None,
        }
    }
}

/// Follower crawl settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Number of concurrent consumers
    pub consumers: usize,

    /// Users with more followers than this are skipped
    #[serde(rename = "max-followers")]
    pub max_followers: i64,

    /// Consecutive 401 responses tolerated before an entry fails
    #[serde(rename = "max-auth-attempts")]
    pub max_auth_attempts: u32,

    /// Poll delay while other consumers still hold claims (milliseconds)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Queue newly seen followers for crawling too
    pub recursive: bool,

    /// Stop queueing discovered users once this many entries exist
    #[serde(rename = "recursive-frontier-cap")]
    pub recursive_frontier_cap: Option<u64>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            database_path: "harvest.db".to_string(),
            consumers: 20,
            max_followers: 50_000,
            max_auth_attempts: 3,
            poll_interval_ms: 1_000,
            recursive: false,
            recursive_frontier_cap: Some(100_000),
        }
    }
}

/// Bulk id fetcher settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Ids per lookup call
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Lookup calls in flight at once
    pub parallelism: usize,

    /// Artifact cache directory
    pub folder: String,

    /// Refetch ids that are already cached
    pub update: bool,

    /// Retry ids carrying a failure marker
    #[serde(rename = "retry-failed")]
    pub retry_failed: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallelism: 8,
            folder: "artifacts".to_string(),
            update: false,
            retry_failed: false,
        }
    }
}

/// Streaming subscription settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Two hangups closer than this abort the subscription (seconds)
    #[serde(rename = "hangup-window-secs")]
    pub hangup_window_secs: u64,

    /// Sleep before resubscribing (seconds)
    #[serde(rename = "reconnect-backoff-secs")]
    pub reconnect_backoff_secs: u64,

    /// Resubscribe after a hangup
    pub reconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            hangup_window_secs: 60,
            reconnect_backoff_secs: 3,
            reconnect: true,
        }
    }
}
