//! Workers and worker leases
//!
//! A worker pairs one credential's transport with that credential's rate-limit
//! table. It is claimed in two steps:
//! 1. `try_claim` flips the `busy` flag with a compare-and-swap
//! 2. `WorkerClaim::lease` takes the worker's exclusive transport lock
//!
//! Dropping the lease releases the lock and then clears `busy`, whatever the
//! outcome of the call made through it.

use crate::api::ApiTransport;
use crate::state::RateLimitTable;
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Execution unit bound to one credential and one transport
pub struct Worker<T: ?Sized = dyn ApiTransport> {
    name: String,
    busy: AtomicBool,
    transport: Arc<AsyncMutex<Box<T>>>,
    limits: Mutex<RateLimitTable>,
}

impl<T: ?Sized> Worker<T> {
    /// Creates an idle worker with an empty rate-limit table
    pub fn new(name: impl Into<String>, transport: Box<T>) -> Self {
        Self::with_limits(name, transport, RateLimitTable::new())
    }

    /// Creates an idle worker with known rate limits
    pub fn with_limits(name: impl Into<String>, transport: Box<T>, limits: RateLimitTable) -> Self {
        Self {
            name: name.into(),
            busy: AtomicBool::new(false),
            transport: Arc::new(AsyncMutex::new(transport)),
            limits: Mutex::new(limits),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Time to wait before this worker may call `endpoint`
    pub fn get_wait(&self, endpoint: &str) -> Duration {
        self.table().get_wait(endpoint)
    }

    /// Whether this worker is throttled on `endpoint`
    pub fn is_limited(&self, endpoint: &str) -> bool {
        self.table().is_limited(endpoint)
    }

    /// Copy of the current rate-limit table
    pub fn limits_snapshot(&self) -> RateLimitTable {
        self.table().clone()
    }

    /// Flags the worker busy if it is idle
    ///
    /// Returns `None` when another caller holds the worker.
    pub fn try_claim(self: &Arc<Self>) -> Option<WorkerClaim<T>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WorkerClaim {
                worker: Arc::clone(self),
            })
    }

    fn table(&self) -> MutexGuard<'_, RateLimitTable> {
        // The table holds plain data, so a poisoned lock is still usable
        self.limits.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Busy flag held on a worker; cleared on drop
pub struct WorkerClaim<T: ?Sized = dyn ApiTransport> {
    worker: Arc<Worker<T>>,
}

impl<T: ?Sized> WorkerClaim<T> {
    pub fn worker(&self) -> &Arc<Worker<T>> {
        &self.worker
    }

    /// Waits for the worker's exclusive transport lock
    pub async fn lease(self) -> WorkerLease<T> {
        let guard = Arc::clone(&self.worker.transport).lock_owned().await;
        WorkerLease { guard, claim: self }
    }
}

impl<T: ?Sized> Drop for WorkerClaim<T> {
    fn drop(&mut self) {
        self.worker.busy.store(false, Ordering::Release);
    }
}

/// Exclusive use of a worker for one call (or one subscription)
pub struct WorkerLease<T: ?Sized = dyn ApiTransport> {
    // Field order matters: the lock is released before `busy` is cleared
    guard: OwnedMutexGuard<Box<T>>,
    claim: WorkerClaim<T>,
}

impl<T: ?Sized> WorkerLease<T> {
    pub fn transport(&self) -> &T {
        &**self.guard
    }

    pub fn worker(&self) -> &Worker<T> {
        &self.claim.worker
    }

    pub fn name(&self) -> &str {
        self.claim.worker.name()
    }

    /// Records the rate limits carried by a response or error
    pub fn update_limits(&self, endpoint: &str, headers: &HeaderMap) {
        self.claim
            .worker
            .table()
            .update_from_headers(endpoint, headers, Utc::now());
    }

    /// Replaces the worker's limits with an `application/rate_limit_status` document
    pub fn load_status(&self, status: &serde_json::Value) -> usize {
        self.claim.worker.table().load_status(status)
    }
}
