//! API call primitives
//!
//! This module contains everything needed to talk to the upstream API:
//! - Endpoint paths and call arguments
//! - The transport traits a worker calls through
//! - The reqwest-backed HTTP transport with OAuth 1.0a signing

mod endpoint;
mod http;
pub mod oauth;
mod transport;

pub use endpoint::{CallArgs, Endpoint};
pub use http::{build_http_client, ndjson_items, HttpTransport};
pub use transport::{
    ApiResponse, ApiTransport, ClosureTransport, ItemStream, StreamTransport, TransportError,
};
