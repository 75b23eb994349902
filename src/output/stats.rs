//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! extraction statistics from the storage layer.

use crate::state::EntryState;
use crate::storage::{RunRecord, Storage};
use crate::HarvestError;
use std::collections::HashMap;

/// Extraction statistics summary
#[derive(Debug, Clone)]
pub struct HarvestStatistics {
    /// Number of stored user profiles
    pub total_users: usize,

    /// Number of extractor entries
    pub total_entries: usize,

    /// Count of entries by state
    pub entries_by_state: HashMap<EntryState, usize>,

    /// Number of follower edges
    pub total_edges: usize,

    /// Most recent extraction run, if any
    pub latest_run: Option<RunRecord>,
}

impl HarvestStatistics {
    pub fn count(&self, state: EntryState) -> usize {
        self.entries_by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(HarvestStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> Result<HarvestStatistics, HarvestError> {
    Ok(HarvestStatistics {
        total_users: storage.list_users()?.len(),
        total_entries: storage.count_entries()?,
        entries_by_state: storage.count_entries_by_state()?,
        total_edges: storage.count_edges(None)?,
        latest_run: storage.get_latest_run()?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Extraction Statistics ===\n");

    println!("Overview:");
    println!("  Users stored: {}", stats.total_users);
    println!("  Extractor entries: {}", stats.total_entries);
    println!("  Follower edges: {}", stats.total_edges);
    println!();

    println!("Entries by State:");
    for state in EntryState::all() {
        let count = stats.count(*state);
        let percentage = if stats.total_entries > 0 {
            (count as f64 / stats.total_entries as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", state, count, percentage);
    }
    println!();

    if let Some(run) = &stats.latest_run {
        println!("Latest Run:");
        println!("  Id: {}", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        println!("  Config hash: {}", run.config_hash);
    }
}
