//! State module for tracking quota and crawl progress
//!
//! # Components
//!
//! - `RateLimitTable`: Per-endpoint rate-limit state of one worker
//! - `EntryState`: Lifecycle state of a crawl entry (queued, in progress, done, ...)

mod entry_state;
mod rate_limit;

// Re-export main types
pub use entry_state::{EntryOutcome, EntryState};
pub use rate_limit::{
    RateLimitEntry, RateLimitTable, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
};
