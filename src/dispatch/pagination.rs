//! Lazy pagination over list endpoints
//!
//! Two control strategies are supported:
//! - Descending id (timelines, search): the next call asks for `max_id = min(id) - 1`
//! - Cursor (follower and friend lists): the next call passes `cursor = next_cursor`
//!
//! The first call always happens before any stop condition is evaluated.

use crate::api::{ApiResponse, CallArgs, Endpoint};
use crate::{HarvestError, Result};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::future::Future;

/// How the next page is requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStrategy {
    /// Watermark pagination; items are the body itself or `body[items_key]`
    DescendingId { items_key: Option<String> },

    /// Cursor pagination; items are `body[items_key]`
    Cursor { items_key: String },
}

impl PageStrategy {
    /// User timelines: the body is an array of posts
    pub fn timeline() -> Self {
        Self::DescendingId { items_key: None }
    }

    /// Search results: posts under `statuses`
    pub fn search() -> Self {
        Self::DescendingId {
            items_key: Some("statuses".to_string()),
        }
    }

    /// Cursor lists such as `followers/ids` (`"ids"`) or `followers/list` (`"users"`)
    pub fn cursor(items_key: impl Into<String>) -> Self {
        Self::Cursor {
            items_key: items_key.into(),
        }
    }

    fn items_key(&self) -> Option<&str> {
        match self {
            Self::DescendingId { items_key } => items_key.as_deref(),
            Self::Cursor { items_key } => Some(items_key),
        }
    }

    /// Extracts the items of one page
    pub fn items(&self, endpoint: &Endpoint, body: &Value) -> Result<Vec<Value>> {
        let found = match self.items_key() {
            Some(key) => body.get(key),
            None => Some(body),
        };

        match found.and_then(Value::as_array) {
            Some(items) => Ok(items.clone()),
            None => Err(HarvestError::MalformedResponse {
                endpoint: endpoint.path(),
                message: match self.items_key() {
                    Some(key) => format!("page has no '{}' array", key),
                    None => "page is not an array".to_string(),
                },
            }),
        }
    }

    /// Arguments of the call after this page, or `None` at the end of the feed
    pub fn next_args(&self, args: &CallArgs, body: &Value, items: &[Value]) -> Option<CallArgs> {
        if items.is_empty() {
            return None;
        }

        match self {
            Self::DescendingId { .. } => {
                let min_id = items.iter().filter_map(item_id).min()?;
                Some(args.clone().with("max_id", min_id - 1))
            }
            Self::Cursor { .. } => {
                let next = body.get("next_cursor").and_then(Value::as_i64)?;
                // -1 and 0 both mark the end of a cursor list
                if next <= 0 {
                    return None;
                }
                Some(args.clone().with("cursor", next))
            }
        }
    }
}

fn item_id(item: &Value) -> Option<i64> {
    item.get("id").and_then(Value::as_i64).or_else(|| {
        item.get("id_str")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    })
}

/// Pages through a feed, yielding its items lazily
///
/// # Arguments
///
/// * `call` - Performs one call (usually [`Dispatcher::call`](crate::Dispatcher::call))
/// * `endpoint` - The list endpoint
/// * `initial_args` - Arguments of the first call
/// * `max_count` - Negative drains the feed; zero makes exactly one call; a
///   positive value stops once at least that many items were yielded (the
///   last page is yielded whole)
/// * `strategy` - How the next page is requested
pub fn consume<F, Fut>(
    call: F,
    endpoint: Endpoint,
    initial_args: CallArgs,
    max_count: i64,
    strategy: PageStrategy,
) -> BoxStream<'static, Result<Value>>
where
    F: Fn(Endpoint, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse>> + Send + 'static,
{
    let state = (call, Some(initial_args), 0usize);

    stream::try_unfold(state, move |(call, args, yielded)| {
        let endpoint = endpoint.clone();
        let strategy = strategy.clone();
        async move {
            let Some(args) = args else {
                return Ok::<_, HarvestError>(None);
            };

            let response = call(endpoint.clone(), args.clone()).await?;
            let items = strategy.items(&endpoint, &response.body)?;
            let yielded = yielded + items.len();

            let reached_count = max_count > 0 && yielded as i64 >= max_count;
            let next = if max_count == 0 || reached_count {
                None
            } else {
                strategy.next_args(&args, &response.body, &items)
            };

            tracing::trace!(
                "Page of {} from {} ({} so far)",
                items.len(),
                endpoint,
                yielded
            );
            let page = stream::iter(items.into_iter().map(Ok::<_, HarvestError>));
            Ok(Some((page, (call, next, yielded))))
        }
    })
    .try_flatten()
    .boxed()
}
