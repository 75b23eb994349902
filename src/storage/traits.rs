//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::{EntryOutcome, EntryState};
use crate::storage::{EdgeRecord, EntryRecord, RunRecord, RunStatus, UserRecord};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    EntryNotFound(i64),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines all database operations needed by the crawl engine.
/// Each consumer owns its own implementation instance (its own connection);
/// exclusion between consumers comes from `claim_next_entry`.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new extraction run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Updates the status of a run and stamps its finish time
    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== User Management =====

    /// Inserts a user or refreshes the stored profile
    fn upsert_user(&mut self, user: &UserRecord) -> StorageResult<()>;

    /// Gets a user by ID
    fn get_user(&self, user_id: i64) -> StorageResult<Option<UserRecord>>;

    /// Gets a user by screen name (case-insensitive)
    fn get_user_by_screen_name(&self, screen_name: &str) -> StorageResult<Option<UserRecord>>;

    /// Returns which of the given ids are stored users
    fn known_user_ids(&self, ids: &[i64]) -> StorageResult<HashSet<i64>>;

    /// Gets every stored user
    fn list_users(&self) -> StorageResult<Vec<UserRecord>>;

    // ===== Entry Management =====

    /// Queues a user for crawling unless it already has an entry
    ///
    /// Returns whether a new entry was created.
    fn enqueue_user(&mut self, user_id: i64) -> StorageResult<bool>;

    /// Gets the entry of a user
    fn get_entry_for_user(&self, user_id: i64) -> StorageResult<Option<EntryRecord>>;

    /// Atomically claims the cheapest claimable entry
    ///
    /// Picks the `pending && !busy` entry whose owner has the fewest followers
    /// and flags it busy in the same write transaction.
    fn claim_next_entry(&mut self) -> StorageResult<Option<EntryRecord>>;

    /// Whether any entry is currently claimed
    fn has_busy_entries(&self) -> StorageResult<bool>;

    /// Clears every busy flag left by a crashed process
    ///
    /// `pending` and `cursor` are preserved. Returns how many entries were reset.
    fn reset_busy_entries(&mut self) -> StorageResult<usize>;

    /// Stores one page of followers and the next cursor in one transaction
    ///
    /// A non-positive `next_cursor` is stored as 0 (finished).
    /// Returns how many new edges were inserted; re-observed edges only
    /// have their `observed_at` refreshed.
    fn record_page(
        &mut self,
        entry_id: i64,
        isfollowed: i64,
        followers: &[i64],
        next_cursor: i64,
    ) -> StorageResult<usize>;

    /// Moves a claimed entry to a terminal state
    fn finish_entry(
        &mut self,
        entry_id: i64,
        outcome: EntryOutcome,
        errors: Option<&str>,
    ) -> StorageResult<()>;

    /// Gives a claimed entry back without finishing it
    fn release_entry(&mut self, entry_id: i64) -> StorageResult<()>;

    /// Marks every pending entry as not pending
    ///
    /// Returns how many entries were changed.
    fn reset_pending(&mut self) -> StorageResult<usize>;

    /// Gets entries, optionally only the pending ones
    fn list_entries(&self, pending_only: bool) -> StorageResult<Vec<EntryRecord>>;

    /// Total number of entries
    fn count_entries(&self) -> StorageResult<usize>;

    /// Number of entries in each state
    fn count_entries_by_state(&self) -> StorageResult<HashMap<EntryState, usize>>;

    // ===== Edge Management =====

    /// Number of stored edges, optionally only those towards one user
    fn count_edges(&self, isfollowed: Option<i64>) -> StorageResult<usize>;

    /// Gets every stored edge
    fn list_edges(&self) -> StorageResult<Vec<EdgeRecord>>;
}
