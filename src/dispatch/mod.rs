//! Credential-pooled call dispatch
//!
//! This module turns a set of credentials into a pool of workers and offers:
//! - `Dispatcher::call` with worker selection, rate-limit waits and retries
//! - `consume`/`Dispatcher::paginate` for lazy feed pagination
//! - `StreamDispatcher::subscribe` for long-lived streaming subscriptions

mod pagination;
mod queue;
mod stream;
mod worker;

pub use pagination::{consume, PageStrategy};
pub use queue::{CallBuilder, Dispatcher, RetryPolicy, RATE_LIMIT_STATUS};
pub use stream::{StreamDispatcher, StreamPolicy};
pub use worker::{Worker, WorkerClaim, WorkerLease};
