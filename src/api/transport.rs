//! Transport traits and error types
//!
//! A transport is the single call primitive a worker owns: it turns an
//! endpoint plus arguments into a JSON body and the response headers, or
//! into a structured error carrying the HTTP status and headers.

use crate::api::{CallArgs, Endpoint};
use async_trait::async_trait;
use futures::stream::BoxStream;
use crate::state::{LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use thiserror::Error;

const REPLAY_QUOTA: i64 = 900;
const REPLAY_WINDOW_SECS: i64 = 900;

/// Body and headers of a successful call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: Value,
    pub headers: HeaderMap,
}

impl ApiResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(body: Value, headers: HeaderMap) -> Self {
        Self { body, headers }
    }

    /// Response reporting an untouched quota on its endpoint
    ///
    /// A bare [`ApiResponse::new`] carries no rate-limit headers and so
    /// throttles the worker that received it; replayed responses use this to
    /// keep the worker available.
    pub fn with_full_quota(body: Value) -> Self {
        let reset = Utc::now() + chrono::Duration::seconds(REPLAY_WINDOW_SECS);
        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_HEADER, HeaderValue::from(REPLAY_QUOTA));
        headers.insert(LIMIT_HEADER, HeaderValue::from(REPLAY_QUOTA));
        headers.insert(RESET_HEADER, HeaderValue::from(reset.timestamp()));
        Self { body, headers }
    }
}

/// Errors raised by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Non-2xx response
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        headers: HeaderMap,
        body: String,
    },

    /// Connection-level failure (refused, reset, timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Response arrived but could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn http(status: u16, headers: HeaderMap, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            headers,
            body: body.into(),
        }
    }
}

/// Items of a live streaming subscription
pub type ItemStream = BoxStream<'static, Result<Value, TransportError>>;

/// Request/response call primitive
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn invoke(&self, endpoint: &Endpoint, args: &CallArgs)
        -> Result<ApiResponse, TransportError>;
}

/// Long-lived streaming call primitive
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        args: &CallArgs,
    ) -> Result<ItemStream, TransportError>;
}

/// Transport backed by a closure
///
/// Useful for replaying recorded responses and for driving the dispatcher
/// and crawl engine without a network.
pub struct ClosureTransport<F> {
    handler: F,
}

impl<F> ClosureTransport<F>
where
    F: Fn(&Endpoint, &CallArgs) -> Result<ApiResponse, TransportError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> ApiTransport for ClosureTransport<F>
where
    F: Fn(&Endpoint, &CallArgs) -> Result<ApiResponse, TransportError> + Send + Sync,
{
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        args: &CallArgs,
    ) -> Result<ApiResponse, TransportError> {
        (self.handler)(endpoint, args)
    }
}
