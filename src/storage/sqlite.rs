//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::{EntryOutcome, EntryState};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{EdgeRecord, EntryRecord, RunRecord, RunStatus, UserRecord};
use crate::HarvestError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// How long a connection waits for another connection's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const ENTRY_COLUMNS: &str = "e.id, e.user_id, e.cursor, e.pending, e.busy, e.outcome, e.errors,
     COALESCE(u.followers_count, 0), e.updated_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while one consumer commits a page
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
        Ok(RunRecord {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            config_hash: row.get(3)?,
            status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                .unwrap_or(RunStatus::Running),
        })
    }

    fn row_to_user(row: &Row<'_>) -> rusqlite::Result<(i64, Option<String>, Option<String>, i64, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn build_user(
        (id, screen_name, name, followers_count, raw): (i64, Option<String>, Option<String>, i64, String),
    ) -> StorageResult<UserRecord> {
        Ok(UserRecord {
            id,
            screen_name,
            name,
            followers_count,
            raw: serde_json::from_str(&raw)?,
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<EntryRecord> {
        let outcome: Option<String> = row.get(5)?;
        Ok(EntryRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            cursor: row.get(2)?,
            pending: row.get(3)?,
            busy: row.get(4)?,
            outcome: outcome.as_deref().and_then(EntryOutcome::from_db_string),
            errors: row.get(6)?,
            followers_count: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn entry_by_id(conn: &Connection, entry_id: i64) -> StorageResult<EntryRecord> {
        conn.query_row(
            &format!(
                "SELECT {} FROM extractor_entries e LEFT JOIN users u ON u.id = e.user_id
                 WHERE e.id = ?1",
                ENTRY_COLUMNS
            ),
            params![entry_id],
            Self::row_to_entry,
        )
        .optional()?
        .ok_or(StorageError::EntryNotFound(entry_id))
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![Self::now(), config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs WHERE id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), Self::now(), run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== User Management =====

    fn upsert_user(&mut self, user: &UserRecord) -> StorageResult<()> {
        let raw = serde_json::to_string(&user.raw)?;
        self.conn.execute(
            "INSERT INTO users (id, screen_name, name, followers_count, raw, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                screen_name = excluded.screen_name,
                name = excluded.name,
                followers_count = excluded.followers_count,
                raw = excluded.raw,
                updated_at = excluded.updated_at",
            params![
                user.id,
                user.screen_name,
                user.name,
                user.followers_count,
                raw,
                Self::now()
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, user_id: i64) -> StorageResult<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, screen_name, name, followers_count, raw FROM users WHERE id = ?1",
                params![user_id],
                Self::row_to_user,
            )
            .optional()?;
        row.map(Self::build_user).transpose()
    }

    fn get_user_by_screen_name(&self, screen_name: &str) -> StorageResult<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, screen_name, name, followers_count, raw FROM users
                 WHERE screen_name = ?1 COLLATE NOCASE LIMIT 1",
                params![screen_name],
                Self::row_to_user,
            )
            .optional()?;
        row.map(Self::build_user).transpose()
    }

    fn known_user_ids(&self, ids: &[i64]) -> StorageResult<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM users WHERE id = ?1")?;
        let mut known = HashSet::new();
        for id in ids {
            if stmt.exists(params![id])? {
                known.insert(*id);
            }
        }
        Ok(known)
    }

    fn list_users(&self) -> StorageResult<Vec<UserRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, screen_name, name, followers_count, raw FROM users ORDER BY id")?;
        let rows = stmt
            .query_map([], Self::row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::build_user).collect()
    }

    // ===== Entry Management =====

    fn enqueue_user(&mut self, user_id: i64) -> StorageResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO extractor_entries (user_id, cursor, pending, busy, updated_at)
             VALUES (?1, -1, 1, 0, ?2)",
            params![user_id, Self::now()],
        )?;
        Ok(inserted > 0)
    }

    fn get_entry_for_user(&self, user_id: i64) -> StorageResult<Option<EntryRecord>> {
        let entry = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM extractor_entries e LEFT JOIN users u ON u.id = e.user_id
                     WHERE e.user_id = ?1",
                    ENTRY_COLUMNS
                ),
                params![user_id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn claim_next_entry(&mut self) -> StorageResult<Option<EntryRecord>> {
        // IMMEDIATE takes the write lock up front, so no other connection can
        // claim between the SELECT and the UPDATE
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        loop {
            let candidate: Option<i64> = tx
                .query_row(
                    "SELECT e.id FROM extractor_entries e LEFT JOIN users u ON u.id = e.user_id
                     WHERE e.pending = 1 AND e.busy = 0
                     ORDER BY COALESCE(u.followers_count, 0) ASC, e.id ASC
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(entry_id) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            let claimed = tx.execute(
                "UPDATE extractor_entries SET busy = 1, updated_at = ?2
                 WHERE id = ?1 AND busy = 0",
                params![entry_id, Self::now()],
            )?;
            if claimed == 0 {
                continue;
            }

            let entry = Self::entry_by_id(&tx, entry_id)?;
            tx.commit()?;
            return Ok(Some(entry));
        }
    }

    fn has_busy_entries(&self) -> StorageResult<bool> {
        let busy = self
            .conn
            .prepare_cached("SELECT 1 FROM extractor_entries WHERE busy = 1 LIMIT 1")?
            .exists([])?;
        Ok(busy)
    }

    fn reset_busy_entries(&mut self) -> StorageResult<usize> {
        let reset = self.conn.execute(
            "UPDATE extractor_entries SET busy = 0, updated_at = ?1 WHERE busy = 1",
            params![Self::now()],
        )?;
        Ok(reset)
    }

    fn record_page(
        &mut self,
        entry_id: i64,
        isfollowed: i64,
        followers: &[i64],
        next_cursor: i64,
    ) -> StorageResult<usize> {
        let now = Self::now();
        let tx = self.conn.transaction()?;

        let mut written = 0;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO followers (isfollowed, follower, observed_at) VALUES (?1, ?2, ?3)",
            )?;
            let mut refresh = tx.prepare_cached(
                "UPDATE followers SET observed_at = ?3 WHERE isfollowed = ?1 AND follower = ?2",
            )?;
            for follower in followers {
                let inserted = insert.execute(params![isfollowed, follower, now])?;
                if inserted == 0 {
                    refresh.execute(params![isfollowed, follower, now])?;
                }
                written += inserted;
            }
        }

        let updated = tx.execute(
            "UPDATE extractor_entries SET cursor = ?2, updated_at = ?3 WHERE id = ?1",
            params![entry_id, next_cursor.max(0), now],
        )?;
        if updated == 0 {
            return Err(StorageError::EntryNotFound(entry_id));
        }

        tx.commit()?;
        Ok(written)
    }

    fn finish_entry(
        &mut self,
        entry_id: i64,
        outcome: EntryOutcome,
        errors: Option<&str>,
    ) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE extractor_entries
             SET pending = 0, busy = 0, outcome = ?2, errors = ?3, updated_at = ?4
             WHERE id = ?1",
            params![entry_id, outcome.to_db_string(), errors, Self::now()],
        )?;
        if updated == 0 {
            return Err(StorageError::EntryNotFound(entry_id));
        }
        Ok(())
    }

    fn release_entry(&mut self, entry_id: i64) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE extractor_entries SET busy = 0, updated_at = ?2 WHERE id = ?1",
            params![entry_id, Self::now()],
        )?;
        if updated == 0 {
            return Err(StorageError::EntryNotFound(entry_id));
        }
        Ok(())
    }

    fn reset_pending(&mut self) -> StorageResult<usize> {
        let reset = self.conn.execute(
            "UPDATE extractor_entries SET pending = 0, updated_at = ?1 WHERE pending = 1",
            params![Self::now()],
        )?;
        Ok(reset)
    }

    fn list_entries(&self, pending_only: bool) -> StorageResult<Vec<EntryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM extractor_entries e LEFT JOIN users u ON u.id = e.user_id
             WHERE (?1 = 0 OR e.pending = 1)
             ORDER BY e.id",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![pending_only], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn count_entries(&self) -> StorageResult<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM extractor_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn count_entries_by_state(&self) -> StorageResult<HashMap<EntryState, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT pending, busy, outcome, COUNT(*) FROM extractor_entries
             GROUP BY pending, busy, outcome",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = HashMap::new();
        for (pending, busy, outcome, count) in rows {
            let outcome = outcome.as_deref().and_then(EntryOutcome::from_db_string);
            *counts
                .entry(EntryState::from_columns(pending, busy, outcome))
                .or_insert(0) += count as usize;
        }
        Ok(counts)
    }

    // ===== Edge Management =====

    fn count_edges(&self, isfollowed: Option<i64>) -> StorageResult<usize> {
        let count: i64 = match isfollowed {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM followers WHERE isfollowed = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM followers", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    fn list_edges(&self) -> StorageResult<Vec<EdgeRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT isfollowed, follower, observed_at FROM followers ORDER BY id")?;
        let edges = stmt
            .query_map([], |row| {
                Ok(EdgeRecord {
                    isfollowed: row.get(0)?,
                    follower: row.get(1)?,
                    observed_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }
}
