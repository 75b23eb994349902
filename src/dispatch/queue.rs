//! Dispatcher: worker selection, waiting and retry
//!
//! The dispatcher spreads calls over its workers:
//! - Workers are scanned in a fresh random order on every selection
//! - A worker is eligible when it is idle and not throttled on the endpoint
//! - When nothing is eligible the caller sleeps until the earliest reset
//! - Throttling and gateway errors re-route the call to another worker
//! - Connection errors are retried after a fixed backoff

use crate::api::{
    ApiResponse, ApiTransport, CallArgs, Endpoint, HttpTransport, TransportError,
};
use crate::config::{ApiConfig, DispatcherConfig};
use crate::credentials::CredentialSource;
use crate::dispatch::pagination::{consume, PageStrategy};
use crate::dispatch::worker::{Worker, WorkerClaim};
use crate::{HarvestError, Result};
use futures::stream::BoxStream;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statuses that mean "this worker cannot serve the call right now"
const REROUTE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Endpoint reporting every rate limit of a credential
pub const RATE_LIMIT_STATUS: &str = "application/rate_limit_status";

/// How the dispatcher waits and retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Block until a worker is eligible instead of failing
    pub wait: bool,

    /// Sleep used when every worker is mid-flight
    pub busy_fallback: Duration,

    /// Sleep before retrying after a connection error
    pub transport_backoff: Duration,

    /// Give up after this many consecutive connection errors (`None` = never)
    pub max_transport_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for RetryPolicy {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            wait: config.wait,
            busy_fallback: Duration::from_secs(config.busy_fallback_secs),
            transport_backoff: Duration::from_secs(config.transport_backoff_secs),
            max_transport_retries: config.max_transport_retries,
        }
    }
}

/// Pool of workers behind a single `call` operation
pub struct Dispatcher {
    workers: Vec<Arc<Worker>>,
    policy: RetryPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher over the given workers
    pub fn new(workers: Vec<Worker>, policy: RetryPolicy) -> Self {
        Self {
            workers: workers.into_iter().map(Arc::new).collect(),
            policy,
        }
    }

    /// Builds one signed HTTP worker per stored credential
    ///
    /// # Arguments
    ///
    /// * `source` - Where the credentials are stored
    /// * `api` - API location and client settings
    /// * `policy` - Waiting and retry policy
    ///
    /// # Returns
    ///
    /// * `Ok(Dispatcher)` - One worker per credential (possibly none)
    /// * `Err(HarvestError)` - Credentials could not be read or a client could not be built
    pub fn from_credentials(
        source: &dyn CredentialSource,
        api: &ApiConfig,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let mut workers = Vec::new();
        for credential in source.iter_credentials()? {
            let name = credential.user.clone();
            let transport = HttpTransport::new(api, credential)?;
            workers.push(Worker::new(name, Box::new(transport) as Box<dyn ApiTransport>));
        }

        tracing::info!("Dispatcher ready with {} workers", workers.len());
        Ok(Self::new(workers, policy))
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Starts a fluent call: `dispatcher.api().segment("followers").segment("ids")`
    pub fn api(&self) -> CallBuilder<'_> {
        CallBuilder {
            dispatcher: self,
            segments: Vec::new(),
            args: CallArgs::new(),
        }
    }

    /// Claims an eligible worker without waiting
    ///
    /// Workers are scanned in random order; the first one that is idle and not
    /// throttled on `endpoint` is claimed.
    pub fn try_select(&self, endpoint: &str) -> Option<WorkerClaim> {
        let mut order: Vec<&Arc<Worker>> = self.workers.iter().collect();
        order.shuffle(&mut rand::rng());

        for worker in order {
            if worker.is_busy() || worker.is_limited(endpoint) {
                continue;
            }
            let Some(claim) = worker.try_claim() else {
                continue;
            };
            // Limits may have changed between the check and the claim
            if worker.is_limited(endpoint) {
                continue;
            }
            return Some(claim);
        }
        None
    }

    /// Claims an eligible worker, waiting for one if the policy allows it
    pub async fn select_worker(&self, endpoint: &str) -> Result<WorkerClaim> {
        loop {
            if let Some(claim) = self.try_select(endpoint) {
                return Ok(claim);
            }

            if !self.policy.wait || self.workers.is_empty() {
                return Err(HarvestError::NoWorkerAvailable {
                    endpoint: endpoint.to_string(),
                });
            }

            let wait = self.calculate_wait(endpoint);
            tracing::info!("No worker available for {}, waiting {:?}", endpoint, wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Minimum wait over idle workers, or the busy fallback when none is idle
    fn calculate_wait(&self, endpoint: &str) -> Duration {
        self.workers
            .iter()
            .filter(|w| !w.is_busy())
            .map(|w| w.get_wait(endpoint))
            .min()
            // Small buffer so the reset has definitely passed
            .map(|wait| wait + Duration::from_millis(10))
            .unwrap_or(self.policy.busy_fallback)
    }

    /// Calls an endpoint through the first eligible worker
    ///
    /// # Retry Logic
    ///
    /// | Condition | Action |
    /// |-----------|--------|
    /// | 2xx | Update limits, return the body |
    /// | HTTP 429/502/503/504 | Update limits from the error, select again |
    /// | No worker left after a 429 (non-waiting) | `Throttled` |
    /// | Other HTTP status | `UpstreamRejected`, not retried |
    /// | Connection error | Sleep the transport backoff, retry |
    /// | Undecodable body | `MalformedResponse`, not retried |
    pub async fn call(&self, endpoint: &Endpoint, args: &CallArgs) -> Result<ApiResponse> {
        let path = endpoint.path();
        let mut transport_failures = 0u32;
        let mut throttled: Option<HarvestError> = None;

        loop {
            // Without waiting, a throttled call that finds no other worker reports the throttle
            let claim = match self.select_worker(&path).await {
                Ok(claim) => claim,
                Err(e) => return Err(throttled.unwrap_or(e)),
            };
            let lease = claim.lease().await;

            let started = Instant::now();
            let result = lease.transport().invoke(endpoint, args).await;
            tracing::debug!(
                "{} {} via {} took {:?}",
                path,
                if result.is_ok() { "ok" } else { "failed" },
                lease.name(),
                started.elapsed()
            );

            match result {
                Ok(response) => {
                    lease.update_limits(&path, &response.headers);
                    return Ok(response);
                }
                Err(TransportError::Http {
                    status, headers, ..
                }) if REROUTE_STATUSES.contains(&status) => {
                    lease.update_limits(&path, &headers);
                    tracing::info!(
                        "HTTP {} from {} on {}, selecting another worker",
                        status,
                        lease.name(),
                        path
                    );
                    if status == 429 {
                        throttled = Some(HarvestError::Throttled {
                            worker: lease.name().to_string(),
                            endpoint: path.clone(),
                        });
                    }
                }
                Err(TransportError::Http { status, body, .. }) => {
                    return Err(HarvestError::UpstreamRejected {
                        endpoint: path,
                        status,
                        message: body,
                    });
                }
                Err(TransportError::Connection(message)) => {
                    drop(lease);
                    transport_failures += 1;
                    if let Some(max) = self.policy.max_transport_retries {
                        if transport_failures > max {
                            return Err(HarvestError::Transport {
                                endpoint: path,
                                message,
                            });
                        }
                    }
                    tracing::warn!(
                        "Transport error on {} (attempt {}): {}. Retrying in {:?}",
                        path,
                        transport_failures,
                        message,
                        self.policy.transport_backoff
                    );
                    tokio::time::sleep(self.policy.transport_backoff).await;
                }
                Err(TransportError::Decode(message)) => {
                    return Err(HarvestError::MalformedResponse {
                        endpoint: path,
                        message,
                    });
                }
            }
        }
    }

    /// Lazily pages through a feed using this dispatcher
    ///
    /// See [`consume`] for the meaning of `max_count`.
    pub fn paginate(
        self: &Arc<Self>,
        endpoint: Endpoint,
        args: CallArgs,
        max_count: i64,
        strategy: PageStrategy,
    ) -> BoxStream<'static, Result<Value>> {
        let dispatcher = Arc::clone(self);
        consume(
            move |endpoint, args| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.call(&endpoint, &args).await }
            },
            endpoint,
            args,
            max_count,
            strategy,
        )
    }

    /// Reloads every idle worker's limits from the rate-limit status endpoint
    ///
    /// Returns how many workers were refreshed. Busy workers are skipped; a
    /// worker whose status call fails keeps its current table.
    pub async fn refresh_all_limits(&self) -> usize {
        let endpoint = Endpoint::parse(RATE_LIMIT_STATUS);
        let args = CallArgs::new();
        let mut refreshed = 0;

        for worker in &self.workers {
            let Some(claim) = worker.try_claim() else {
                continue;
            };
            let lease = claim.lease().await;
            match lease.transport().invoke(&endpoint, &args).await {
                Ok(response) => {
                    let loaded = lease.load_status(&response.body);
                    tracing::debug!("Loaded {} limits for {}", loaded, lease.name());
                    refreshed += 1;
                }
                Err(e) => {
                    tracing::warn!("Could not refresh limits for {}: {}", lease.name(), e);
                }
            }
        }
        refreshed
    }
}

/// Fluent builder over explicit path segments
pub struct CallBuilder<'a> {
    dispatcher: &'a Dispatcher,
    segments: Vec<String>,
    args: CallArgs,
}

impl<'a> CallBuilder<'a> {
    /// Appends a path segment
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Appends every segment of a slash-separated path
    pub fn path(mut self, path: &str) -> Self {
        self.segments
            .extend(Endpoint::parse(path).segments().iter().cloned());
        self
    }

    /// Adds a query argument
    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.set(key, value);
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.segments.iter().cloned())
    }

    pub async fn send(self) -> Result<ApiResponse> {
        let endpoint = self.endpoint();
        self.dispatcher.call(&endpoint, &self.args).await
    }
}
