//! Storage module for persisting crawl data
//!
//! This module handles all database operations for the follower crawl, including:
//! - SQLite database initialization and schema management
//! - User profile upserts
//! - Extractor entry claims, cursors and outcomes
//! - Follower edge tracking
//! - Run tracking

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{EntryOutcome, EntryState};
use crate::HarvestError;
use serde_json::Value;
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(HarvestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path)
}

/// A user profile in the database
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub screen_name: Option<String>,
    pub name: Option<String>,
    pub followers_count: i64,
    pub raw: Value,
}

impl UserRecord {
    /// Builds a record from an API user object
    ///
    /// Returns `None` when the object carries no usable id.
    pub fn from_json(user: &Value) -> Option<Self> {
        let id = user.get("id").and_then(Value::as_i64).or_else(|| {
            user.get("id_str")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })?;

        Some(Self {
            id,
            screen_name: user
                .get("screen_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: user.get("name").and_then(Value::as_str).map(str::to_string),
            followers_count: user
                .get("followers_count")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            raw: user.clone(),
        })
    }
}

/// An extractor entry joined with its owner's follower count
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRecord {
    pub id: i64,
    pub user_id: i64,
    pub cursor: i64,
    pub pending: bool,
    pub busy: bool,
    pub outcome: Option<EntryOutcome>,
    pub errors: Option<String>,
    pub followers_count: i64,
    pub updated_at: String,
}

impl EntryRecord {
    pub fn state(&self) -> EntryState {
        EntryState::from_columns(self.pending, self.busy, self.outcome)
    }
}

/// A follower edge: `follower` follows `isfollowed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub isfollowed: i64,
    pub follower: i64,
    pub observed_at: String,
}

/// An extraction run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of an extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
