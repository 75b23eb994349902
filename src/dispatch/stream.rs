//! Streaming subscriptions with reconnect and a hangup breaker
//!
//! A subscription holds one idle worker for its whole lifetime. Rate limits
//! are not consulted. When the connection drops or ends, the subscription
//! either stops (reconnect disabled) or sleeps the backoff and subscribes
//! again. Two hangups inside the hangup window end it with `TooManyHangups`.

use crate::api::{CallArgs, Endpoint, HttpTransport, ItemStream, StreamTransport, TransportError};
use crate::config::{ApiConfig, StreamConfig};
use crate::credentials::CredentialSource;
use crate::dispatch::worker::{Worker, WorkerLease};
use crate::{HarvestError, Result};
use futures::stream::{self, BoxStream, StreamExt};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reconnect behaviour of a subscription
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub reconnect: bool,
    pub hangup_window: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            reconnect: config.reconnect,
            hangup_window: Duration::from_secs(config.hangup_window_secs),
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
        }
    }
}

/// Pool of workers serving streaming subscriptions
pub struct StreamDispatcher {
    workers: Vec<Arc<Worker<dyn StreamTransport>>>,
    policy: StreamPolicy,
}

impl StreamDispatcher {
    pub fn new(workers: Vec<Worker<dyn StreamTransport>>, policy: StreamPolicy) -> Self {
        Self {
            workers: workers.into_iter().map(Arc::new).collect(),
            policy,
        }
    }

    /// Builds one streaming worker per stored credential
    pub fn from_credentials(
        source: &dyn CredentialSource,
        api: &ApiConfig,
        policy: StreamPolicy,
    ) -> Result<Self> {
        let mut workers = Vec::new();
        for credential in source.iter_credentials()? {
            let name = credential.user.clone();
            let transport = HttpTransport::new(api, credential)?;
            workers.push(Worker::new(
                name,
                Box::new(transport) as Box<dyn StreamTransport>,
            ));
        }
        Ok(Self::new(workers, policy))
    }

    pub fn workers(&self) -> &[Arc<Worker<dyn StreamTransport>>] {
        &self.workers
    }

    /// Opens a subscription on an idle worker
    ///
    /// The returned stream forwards items as they arrive. Fails with
    /// `NoWorkerAvailable` if every worker already serves a subscription.
    pub async fn subscribe(
        &self,
        endpoint: Endpoint,
        args: CallArgs,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let claim = {
            let mut order: Vec<&Arc<Worker<dyn StreamTransport>>> = self.workers.iter().collect();
            order.shuffle(&mut rand::rng());
            order.into_iter().find_map(|w| w.try_claim())
        };
        let Some(claim) = claim else {
            return Err(HarvestError::NoWorkerAvailable {
                endpoint: endpoint.path(),
            });
        };

        let lease = claim.lease().await;
        tracing::info!("Subscribing to {} via {}", endpoint, lease.name());

        let state = Subscription {
            lease,
            endpoint,
            args,
            policy: self.policy.clone(),
            phase: Phase::Connect,
            last_hangup: None,
        };
        Ok(stream::unfold(state, Subscription::next_item).boxed())
    }
}

enum Phase {
    Connect,
    Streaming(ItemStream),
    Finished,
}

/// What to do after the connection went away
#[derive(Debug, PartialEq, Eq)]
enum HangupAction {
    Reconnect(Duration),
    Stop,
    Abort,
}

struct Subscription {
    lease: WorkerLease<dyn StreamTransport>,
    endpoint: Endpoint,
    args: CallArgs,
    policy: StreamPolicy,
    phase: Phase,
    last_hangup: Option<Instant>,
}

impl Subscription {
    async fn next_item(mut self) -> Option<(Result<Value>, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,

                Phase::Connect => {
                    let connected = self
                        .lease
                        .transport()
                        .subscribe(&self.endpoint, &self.args)
                        .await;
                    match connected {
                        Ok(items) => self.phase = Phase::Streaming(items),
                        Err(e) => {
                            if let Some(fatal) = self.rejection(&e) {
                                return Some((Err(fatal), self));
                            }
                            if let Some(err) = self.hangup(Some(e)).await {
                                return Some((Err(err), self));
                            }
                        }
                    }
                }

                Phase::Streaming(mut items) => match items.next().await {
                    Some(Ok(item)) => {
                        self.phase = Phase::Streaming(items);
                        return Some((Ok(item), self));
                    }
                    Some(Err(TransportError::Decode(message))) => {
                        // A single bad line does not end the subscription
                        tracing::warn!("Skipping undecodable item on {}: {}", self.endpoint, message);
                        self.phase = Phase::Streaming(items);
                    }
                    Some(Err(e)) => {
                        if let Some(err) = self.hangup(Some(e)).await {
                            return Some((Err(err), self));
                        }
                    }
                    None => {
                        if let Some(err) = self.hangup(None).await {
                            return Some((Err(err), self));
                        }
                    }
                },
            }
        }
    }

    /// Client errors on subscribe are not hangups and end the subscription
    fn rejection(&self, error: &TransportError) -> Option<HarvestError> {
        match error {
            TransportError::Http { status, body, .. }
                if (400..500).contains(status) && *status != 420 && *status != 429 =>
            {
                Some(HarvestError::UpstreamRejected {
                    endpoint: self.endpoint.path(),
                    status: *status,
                    message: body.clone(),
                })
            }
            _ => None,
        }
    }

    /// Handles a hangup; returns the error to yield when the subscription ends with one
    ///
    /// On reconnect the phase is set back to `Connect` after the backoff.
    async fn hangup(&mut self, cause: Option<TransportError>) -> Option<HarvestError> {
        let now = Instant::now();
        match decide_hangup(&self.policy, self.last_hangup, now) {
            HangupAction::Reconnect(backoff) => {
                tracing::warn!(
                    "Stream {} hung up ({}), reconnecting in {:?}",
                    self.endpoint,
                    cause
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "closed".to_string()),
                    backoff
                );
                self.last_hangup = Some(now);
                tokio::time::sleep(backoff).await;
                self.phase = Phase::Connect;
                None
            }
            HangupAction::Stop => cause.map(|e| HarvestError::Transport {
                endpoint: self.endpoint.path(),
                message: e.to_string(),
            }),
            HangupAction::Abort => {
                tracing::error!("Too many hangups on {}", self.endpoint);
                Some(HarvestError::TooManyHangups {
                    window_secs: self.policy.hangup_window.as_secs(),
                })
            }
        }
    }
}

fn decide_hangup(policy: &StreamPolicy, last_hangup: Option<Instant>, now: Instant) -> HangupAction {
    if !policy.reconnect {
        return HangupAction::Stop;
    }
    match last_hangup {
        Some(last) if now.duration_since(last) < policy.hangup_window => HangupAction::Abort,
        _ => HangupAction::Reconnect(policy.reconnect_backoff),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves one scripted connection per subscribe call
    struct ScriptedStream {
        connections: Vec<Vec<std::result::Result<Value, TransportError>>>,
        opened: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamTransport for ScriptedStream {
        async fn subscribe(
            &self,
            _endpoint: &Endpoint,
            _args: &CallArgs,
        ) -> std::result::Result<ItemStream, TransportError> {
            let index = self.opened.fetch_add(1, Ordering::SeqCst);
            match self.connections.get(index) {
                Some(items) => {
                    let items: Vec<_> = items
                        .iter()
                        .map(|item| match item {
                            Ok(v) => Ok(v.clone()),
                            Err(e) => Err(TransportError::Connection(e.to_string())),
                        })
                        .collect();
                    Ok(stream::iter(items).boxed())
                }
                None => Err(TransportError::Connection("refused".to_string())),
            }
        }
    }

    fn dispatcher(
        connections: Vec<Vec<std::result::Result<Value, TransportError>>>,
        policy: StreamPolicy,
    ) -> (StreamDispatcher, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedStream {
            connections,
            opened: Arc::clone(&opened),
        };
        let worker = Worker::new("a", Box::new(transport) as Box<dyn StreamTransport>);
        (StreamDispatcher::new(vec![worker], policy), opened)
    }

    fn policy(reconnect: bool, window_ms: u64) -> StreamPolicy {
        StreamPolicy {
            reconnect,
            hangup_window: Duration::from_millis(window_ms),
            reconnect_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_decide_hangup() {
        let now = Instant::now();
        let p = policy(true, 60_000);
        assert_eq!(
            decide_hangup(&p, None, now),
            HangupAction::Reconnect(Duration::from_millis(5))
        );
        assert_eq!(decide_hangup(&p, Some(now), now), HangupAction::Abort);
        assert_eq!(decide_hangup(&policy(false, 60_000), None, now), HangupAction::Stop);
    }

    #[tokio::test]
    async fn test_without_reconnect_single_hangup_ends() {
        let (dispatcher, opened) =
            dispatcher(vec![vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))]], policy(false, 0));

        let items: Vec<_> = dispatcher
            .subscribe(Endpoint::parse("statuses/filter"), CallArgs::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_reconnect_failure_is_reported() {
        let (dispatcher, _) = dispatcher(
            vec![vec![
                Ok(json!({"id": 1})),
                Err(TransportError::Connection("reset".to_string())),
            ]],
            policy(false, 0),
        );

        let items: Vec<_> = dispatcher
            .subscribe(Endpoint::parse("statuses/filter"), CallArgs::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(HarvestError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_two_quick_hangups_abort() {
        let (dispatcher, opened) = dispatcher(
            vec![vec![Ok(json!({"id": 1}))], vec![Ok(json!({"id": 2}))]],
            policy(true, 60_000),
        );

        let items: Vec<_> = dispatcher
            .subscribe(Endpoint::parse("statuses/filter"), CallArgs::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap()["id"], 1);
        assert_eq!(items[1].as_ref().unwrap()["id"], 2);
        assert!(matches!(items[2], Err(HarvestError::TooManyHangups { .. })));
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_spaced_hangups_keep_reconnecting() {
        // A zero-length window never trips the breaker
        let (dispatcher, opened) = dispatcher(
            vec![
                vec![Ok(json!({"id": 1}))],
                vec![Ok(json!({"id": 2}))],
                vec![Ok(json!({"id": 3}))],
            ],
            policy(true, 0),
        );

        let items: Vec<Value> = dispatcher
            .subscribe(Endpoint::parse("statuses/filter"), CallArgs::new())
            .await
            .unwrap()
            .take(3)
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_subscription_holds_worker() {
        let (dispatcher, _) = dispatcher(vec![vec![Ok(json!({"id": 1}))]], policy(false, 0));

        let subscription = dispatcher
            .subscribe(Endpoint::parse("statuses/sample"), CallArgs::new())
            .await
            .unwrap();
        assert!(dispatcher.workers()[0].is_busy());

        let second = dispatcher
            .subscribe(Endpoint::parse("statuses/sample"), CallArgs::new())
            .await;
        assert!(matches!(second, Err(HarvestError::NoWorkerAvailable { .. })));

        drop(subscription);
        assert!(!dispatcher.workers()[0].is_busy());
    }
}
