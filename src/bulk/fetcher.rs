//! Batched lookups of many ids through the dispatcher
//!
//! Ids flow through three stages:
//! 1. Ids already cached (or marked failed) are reported as skipped
//! 2. The rest are grouped into batches, one lookup call each
//! 3. Every id of a batch is written, marked failed, or reported as an error
//!
//! Batches run with bounded parallelism and their results arrive unordered.

use crate::api::{CallArgs, Endpoint};
use crate::bulk::artifact::ArtifactStore;
use crate::config::BulkConfig;
use crate::dispatch::Dispatcher;
use crate::{HarvestError, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Most ids a single lookup call accepts
pub const MAX_LOOKUP_BATCH: usize = 100;

/// What the ids identify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Tweets,
    UserIds,
    ScreenNames,
}

impl LookupKind {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Tweets => Endpoint::parse("statuses/lookup"),
            Self::UserIds | Self::ScreenNames => Endpoint::parse("users/lookup"),
        }
    }

    /// Arguments for a lookup of `ids`
    pub fn args(&self, ids: &[String]) -> CallArgs {
        let joined = ids.join(",");
        match self {
            Self::Tweets => CallArgs::new()
                .with("id", joined)
                .with("map", "true"),
            Self::UserIds => CallArgs::new().with("user_id", joined),
            Self::ScreenNames => CallArgs::new().with("screen_name", joined),
        }
    }

    /// Normalized form used to match requested ids against returned items
    pub fn key(&self, id: &str) -> String {
        match self {
            Self::ScreenNames => id.trim().trim_start_matches('@').to_lowercase(),
            Self::Tweets | Self::UserIds => id.trim().to_string(),
        }
    }

    fn item_key(&self, item: &Value) -> Option<String> {
        let raw = match self {
            Self::ScreenNames => item.get("screen_name").and_then(Value::as_str)?.to_string(),
            Self::Tweets | Self::UserIds => match item.get("id_str").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => item.get("id").and_then(Value::as_i64)?.to_string(),
            },
        };
        Some(self.key(&raw))
    }

    /// Collects the items present in a lookup response, keyed by [`LookupKind::key`]
    ///
    /// Accepts both the `map=true` shape (`{"id": {"<id>": item | null}}`)
    /// and a plain array of items.
    pub fn extract(&self, endpoint: &Endpoint, body: &Value) -> Result<HashMap<String, Value>> {
        if let Some(map) = body.get("id").and_then(Value::as_object) {
            return Ok(map
                .iter()
                .filter(|(_, item)| !item.is_null())
                .map(|(id, item)| (self.key(id), item.clone()))
                .collect());
        }

        let items = body
            .as_array()
            .ok_or_else(|| HarvestError::MalformedResponse {
                endpoint: endpoint.path(),
                message: "lookup response is neither a map nor a list".to_string(),
            })?;

        Ok(items
            .iter()
            .filter_map(|item| Some((self.item_key(item)?, item.clone())))
            .collect())
    }
}

/// What happened to one requested id
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Fetched and stored
    Found { id: String, item: Value },
    /// Absent upstream; a failure marker was written
    Missing { id: String },
    /// Already cached or marked failed; no call was made
    Skipped { id: String },
    /// The batch carrying this id failed
    Error { id: String, message: String },
}

impl FetchOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Found { id, .. }
            | Self::Missing { id }
            | Self::Skipped { id }
            | Self::Error { id, .. } => id,
        }
    }
}

/// Tuning for a bulk run
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub batch_size: usize,
    pub parallelism: usize,
    /// Fetch ids even when they are cached
    pub update: bool,
    /// Fetch ids even when they carry a failure marker
    pub retry_failed: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self::from(&BulkConfig::default())
    }
}

impl From<&BulkConfig> for BulkOptions {
    fn from(config: &BulkConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            parallelism: config.parallelism,
            update: config.update,
            retry_failed: config.retry_failed,
        }
    }
}

/// Unit of work after the cache filter
#[derive(Debug, PartialEq)]
enum Unit {
    Skip(String),
    Batch(Vec<String>),
}

/// Lazily turns ids into skips and full batches
struct Planner<I> {
    ids: I,
    store: Arc<dyn ArtifactStore>,
    options: BulkOptions,
    batch: Vec<String>,
}

impl<I: Iterator<Item = String>> Iterator for Planner<I> {
    type Item = Unit;

    fn next(&mut self) -> Option<Unit> {
        let size = self.options.batch_size.clamp(1, MAX_LOOKUP_BATCH);
        loop {
            let Some(id) = self.ids.next() else {
                if self.batch.is_empty() {
                    return None;
                }
                return Some(Unit::Batch(std::mem::take(&mut self.batch)));
            };

            let id = id.trim().to_string();
            if id.is_empty() {
                continue;
            }

            let cached = !self.options.update && self.store.is_cached(&id);
            let failed = !self.options.retry_failed && self.store.is_failed(&id);
            if cached || failed {
                return Some(Unit::Skip(id));
            }

            self.batch.push(id);
            if self.batch.len() >= size {
                return Some(Unit::Batch(std::mem::take(&mut self.batch)));
            }
        }
    }
}

/// Fetches many ids in batches and stores them as artifacts
pub struct BulkFetcher {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn ArtifactStore>,
    options: BulkOptions,
}

impl BulkFetcher {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn ArtifactStore>,
        options: BulkOptions,
    ) -> Self {
        Self {
            dispatcher,
            store,
            options,
        }
    }

    /// Fetches `ids`, yielding one outcome per id in completion order
    ///
    /// A failing batch never ends the stream; its ids come back as
    /// [`FetchOutcome::Error`].
    pub fn fetch<I>(&self, kind: LookupKind, ids: I) -> BoxStream<'static, FetchOutcome>
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        let planner = Planner {
            ids: ids.into_iter(),
            store: Arc::clone(&self.store),
            options: self.options.clone(),
            batch: Vec::new(),
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let store = Arc::clone(&self.store);

        stream::iter(planner)
            .map(move |unit| {
                let dispatcher = Arc::clone(&dispatcher);
                let store = Arc::clone(&store);
                async move {
                    match unit {
                        Unit::Skip(id) => vec![FetchOutcome::Skipped { id }],
                        Unit::Batch(ids) => fetch_batch(&dispatcher, store.as_ref(), kind, ids).await,
                    }
                }
            })
            .buffer_unordered(self.options.parallelism.max(1))
            .flat_map(stream::iter)
            .boxed()
    }
}

async fn fetch_batch(
    dispatcher: &Dispatcher,
    store: &dyn ArtifactStore,
    kind: LookupKind,
    ids: Vec<String>,
) -> Vec<FetchOutcome> {
    let endpoint = kind.endpoint();
    tracing::debug!("Looking up {} ids on {}", ids.len(), endpoint);

    let found = match dispatcher.call(&endpoint, &kind.args(&ids)).await {
        Ok(response) => kind.extract(&endpoint, &response.body),
        // The lookup endpoints answer 404 when none of the ids exist
        Err(e) if e.upstream_status() == Some(404) => Ok(HashMap::new()),
        Err(e) => Err(e),
    };

    let found = match found {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!("Batch of {} ids failed: {}", ids.len(), e);
            let message = e.to_string();
            return ids
                .into_iter()
                .map(|id| FetchOutcome::Error {
                    id,
                    message: message.clone(),
                })
                .collect();
        }
    };

    ids.into_iter()
        .map(|id| match found.get(&kind.key(&id)) {
            Some(item) => match store.write(&id, item) {
                Ok(()) => FetchOutcome::Found {
                    id,
                    item: item.clone(),
                },
                Err(e) => FetchOutcome::Error {
                    id,
                    message: e.to_string(),
                },
            },
            None => match store.mark_failed(&id) {
                Ok(()) => FetchOutcome::Missing { id },
                Err(e) => FetchOutcome::Error {
                    id,
                    message: e.to_string(),
                },
            },
        })
        .collect()
}

/// Resolves user ids or screen names to user objects
///
/// Looks the users up in batches of [`MAX_LOOKUP_BATCH`], sequentially.
/// Unknown users are left out of the result; any other failure is returned.
///
/// # Arguments
///
/// * `dispatcher` - Dispatcher carrying the calls
/// * `users` - User ids or screen names
/// * `by_name` - Whether `users` are screen names
pub async fn lookup_users(
    dispatcher: &Dispatcher,
    users: &[String],
    by_name: bool,
) -> Result<Vec<Value>> {
    let kind = if by_name {
        LookupKind::ScreenNames
    } else {
        LookupKind::UserIds
    };
    let endpoint = kind.endpoint();
    let mut found = Vec::new();

    for batch in users.chunks(MAX_LOOKUP_BATCH) {
        let body = match dispatcher.call(&endpoint, &kind.args(batch)).await {
            Ok(response) => response.body,
            Err(e) if e.upstream_status() == Some(404) => continue,
            Err(e) => return Err(e),
        };
        found.extend(kind.extract(&endpoint, &body)?.into_values());
    }

    Ok(found)
}
