//! Output module for reports and exports
//!
//! This module handles:
//! - Printing extraction statistics from the crawl database
//! - Exporting the follower network
//! - Summarizing rate limits across credentials

pub mod limits;
mod network;
pub mod stats;

pub use limits::{LimitReport, LimitUsage};
pub use network::{write_network, NetworkFormat};
pub use stats::{load_statistics, print_statistics, HarvestStatistics};
