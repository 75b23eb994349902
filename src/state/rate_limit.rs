use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the calls left in the current window
pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
/// Header carrying the window size
pub const LIMIT_HEADER: &str = "x-rate-limit-limit";
/// Header carrying the window reset as epoch seconds
pub const RESET_HEADER: &str = "x-rate-limit-reset";

/// Reset applied when a response carries no reset header
const DEFAULT_RESET_SECS: i64 = 30;

/// Rate-limit state of one endpoint for one credential
///
/// `remaining <= limit` holds after every update; `reset_at` is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Calls left before the window resets
    pub remaining: i64,

    /// Size of the window
    pub limit: i64,

    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    /// Creates an entry, normalizing so that `0 <= remaining <= limit`
    ///
    /// An unknown (negative) or smaller limit is raised to `remaining`.
    pub fn new(remaining: i64, limit: i64, reset_at: DateTime<Utc>) -> Self {
        let remaining = remaining.max(0);
        Self {
            remaining,
            limit: limit.max(remaining),
            reset_at,
        }
    }

    /// Time to wait at `now` before this endpoint can be called again
    ///
    /// Zero while calls remain, otherwise the time left until the reset, which
    /// is zero once `now >= reset_at`.
    pub fn wait_at(&self, now: DateTime<Utc>) -> Duration {
        if self.remaining > 0 {
            return Duration::ZERO;
        }
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Builds an entry from the rate-limit headers of a response
    ///
    /// # Arguments
    ///
    /// * `headers` - Response or error headers
    /// * `now` - Current time, used for the default reset
    ///
    /// Missing fields default to remaining=0, limit=-1 and a reset 30 seconds
    /// from now, so an endpoint with unreadable headers is treated as throttled.
    pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let remaining = header_number(headers, REMAINING_HEADER)
            .map(|v| v as i64)
            .unwrap_or(0);
        let limit = header_number(headers, LIMIT_HEADER)
            .map(|v| v as i64)
            .unwrap_or(-1);
        let reset_at = header_number(headers, RESET_HEADER)
            .and_then(epoch_to_datetime)
            .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_RESET_SECS));

        Self::new(remaining, limit, reset_at)
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Per-endpoint rate limits of one worker
///
/// Keys are normalized endpoint paths such as `/followers/ids`.
#[derive(Debug, Clone, Default)]
pub struct RateLimitTable {
    entries: HashMap<String, RateLimitEntry>,
}

impl RateLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time to wait before calling `endpoint`
    ///
    /// Unknown endpoints are treated as available.
    pub fn get_wait(&self, endpoint: &str) -> Duration {
        self.get_wait_at(endpoint, Utc::now())
    }

    /// Same as [`get_wait`](Self::get_wait) evaluated at a given instant
    pub fn get_wait_at(&self, endpoint: &str, now: DateTime<Utc>) -> Duration {
        self.entries
            .get(endpoint)
            .map(|entry| entry.wait_at(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether `endpoint` is currently throttled
    pub fn is_limited(&self, endpoint: &str) -> bool {
        self.get_wait(endpoint) > Duration::ZERO
    }

    /// Records the rate limits carried by a response for `endpoint`
    pub fn update_from_headers(&mut self, endpoint: &str, headers: &HeaderMap, now: DateTime<Utc>) {
        let entry = RateLimitEntry::from_headers(headers, now);
        tracing::trace!(
            "Rate limit for {}: {}/{} until {}",
            endpoint,
            entry.remaining,
            entry.limit,
            entry.reset_at
        );
        self.entries.insert(endpoint.to_string(), entry);
    }

    /// Sets the entry of one endpoint directly
    pub fn set(&mut self, endpoint: &str, entry: RateLimitEntry) {
        self.entries.insert(endpoint.to_string(), entry);
    }

    pub fn get(&self, endpoint: &str) -> Option<&RateLimitEntry> {
        self.entries.get(endpoint)
    }

    /// Seeds the table from a `application/rate_limit_status` document
    ///
    /// The document groups endpoints by family:
    /// `{"resources": {"followers": {"/followers/ids": {"limit": 15, "remaining": 15, "reset": 1700000000}}}}`.
    /// Returns how many endpoints were loaded.
    pub fn load_status(&mut self, status: &Value) -> usize {
        let Some(resources) = status.get("resources").and_then(Value::as_object) else {
            return 0;
        };

        let mut loaded = 0;
        for family in resources.values().filter_map(Value::as_object) {
            for (path, limits) in family {
                let remaining = limits.get("remaining").and_then(Value::as_i64);
                let limit = limits.get("limit").and_then(Value::as_i64);
                let reset = limits
                    .get("reset")
                    .and_then(Value::as_f64)
                    .and_then(epoch_to_datetime);

                if let (Some(remaining), Some(limit), Some(reset_at)) = (remaining, limit, reset) {
                    self.entries
                        .insert(path.clone(), RateLimitEntry::new(remaining, limit, reset_at));
                    loaded += 1;
                }
            }
        }
        loaded
    }

    /// Iterates over all known endpoints
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RateLimitEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
