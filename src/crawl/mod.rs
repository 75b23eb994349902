//! Follower crawl
//!
//! This module drives the resumable follower extraction:
//! - Seeding the queue from user ids or screen names
//! - Claiming entries and paging through their followers
//! - Recovering from crashes and interruptions
//! - Counting progress across consumers

mod engine;
mod stats;

pub use engine::{
    load_targets, CrawlEngine, CrawlOptions, CrawlReport, PendingEntries, Target,
};
pub use stats::{CrawlSnapshot, CrawlStats};
