//! Live counters shared by every crawl consumer

use crate::state::EntryOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Progress counters of a running extraction
#[derive(Debug)]
pub struct CrawlStats {
    enqueued: AtomicU64,
    collected: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    edges: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of [`CrawlStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrawlSnapshot {
    pub enqueued: u64,
    pub collected: u64,
    pub skipped: u64,
    pub failed: u64,
    pub edges: u64,
}

impl CrawlSnapshot {
    /// Entries that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.collected + self.skipped + self.failed
    }
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            collected: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_enqueued(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_edges(&self, count: u64) {
        self.edges.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts a finished entry and returns how many have finished so far
    pub fn record_outcome(&self, outcome: EntryOutcome) -> u64 {
        let counter = match outcome {
            EntryOutcome::Done => &self.collected,
            EntryOutcome::Skipped => &self.skipped,
            EntryOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.snapshot().finished()
    }

    pub fn snapshot(&self) -> CrawlSnapshot {
        CrawlSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
        }
    }

    /// Logs a progress line
    pub fn log_progress(&self) {
        let snapshot = self.snapshot();
        let elapsed = self.started.elapsed();
        let rate = snapshot.finished() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        tracing::info!(
            "Progress: {} collected, {} skipped, {} failed, {} edges, {} enqueued, {:.2} users/sec",
            snapshot.collected,
            snapshot.skipped,
            snapshot.failed,
            snapshot.edges,
            snapshot.enqueued,
            rate
        );
    }
}
