//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the Quota-Harvester database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track extraction runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Profiles fetched from the API
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    screen_name TEXT,
    name TEXT,
    followers_count INTEGER NOT NULL DEFAULT 0,
    raw TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_screen_name ON users(screen_name COLLATE NOCASE);

-- Follower crawl work, one entry per user
CREATE TABLE IF NOT EXISTS extractor_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
    cursor INTEGER NOT NULL DEFAULT -1,
    pending INTEGER NOT NULL DEFAULT 1,
    busy INTEGER NOT NULL DEFAULT 0,
    outcome TEXT,
    errors TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_claimable ON extractor_entries(pending, busy);

-- Follower edges: `follower` follows `isfollowed`
CREATE TABLE IF NOT EXISTS followers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    isfollowed INTEGER NOT NULL,
    follower INTEGER NOT NULL,
    observed_at TEXT NOT NULL,
    UNIQUE(isfollowed, follower)
);

CREATE INDEX IF NOT EXISTS idx_followers_isfollowed ON followers(isfollowed);
CREATE INDEX IF NOT EXISTS idx_followers_follower ON followers(follower);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", get_schema_version())?;
    Ok(())
}

/// Gets the current schema version
///
/// Stored in `PRAGMA user_version` for future migrations.
pub fn get_schema_version() -> u32 {
    1
}
