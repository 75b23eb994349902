//! Resumable follower extraction
//!
//! The engine keeps its whole work queue in SQLite:
//! - Every user to crawl has one extractor entry with a follower cursor
//! - Consumers claim entries atomically, cheapest (fewest followers) first
//! - Each page of follower ids is committed together with the next cursor
//! - Entries left busy by a crashed process are reset on start-up
//!
//! Any number of consumers (or processes) can share one database; a claim is
//! the only thing that keeps two of them off the same entry.

use crate::api::{CallArgs, Endpoint};
use crate::bulk::lookup_users;
use crate::config::CrawlConfig;
use crate::crawl::stats::{CrawlSnapshot, CrawlStats};
use crate::dispatch::Dispatcher;
use crate::shutdown::ShutdownSignal;
use crate::state::EntryOutcome;
use crate::storage::{EntryRecord, RunStatus, SqliteStorage, Storage, UserRecord};
use crate::{HarvestError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint returning one page of follower ids
const FOLLOWERS_ENDPOINT: &str = "followers/ids";

/// Progress is logged every this many finished entries
const PROGRESS_INTERVAL: u64 = 10;

/// Tuning for an extraction
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub consumers: usize,
    pub max_followers: i64,
    pub max_auth_attempts: u32,
    pub poll_interval: Duration,
    pub recursive: bool,
    pub recursive_frontier_cap: Option<u64>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for CrawlOptions {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            consumers: config.consumers,
            max_followers: config.max_followers,
            max_auth_attempts: config.max_auth_attempts,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            recursive: config.recursive,
            recursive_frontier_cap: config.recursive_frontier_cap,
        }
    }
}

/// A seed target: numeric user id or screen name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(i64),
    ScreenName(String),
}

impl Target {
    /// Classifies a raw target; screen names lose any leading `@`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(id) = raw.parse::<i64>() {
            return Some(Self::Id(id));
        }
        let name = raw.rsplit('@').next().unwrap_or(raw).trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::ScreenName(name.to_string()))
    }
}

/// Reads seed targets from a file, one per line
///
/// Only the first comma-separated column counts; blank lines are ignored.
pub fn load_targets(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(str::to_string)
        .collect())
}

/// Hands out claimed entries to one consumer
///
/// When nothing is claimable but another consumer still holds an entry, it
/// polls instead of finishing, since that entry may yet enqueue more work.
pub struct PendingEntries {
    poll_interval: Duration,
    shutdown: Arc<ShutdownSignal>,
}

impl PendingEntries {
    pub fn new(poll_interval: Duration, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            poll_interval,
            shutdown,
        }
    }

    /// Claims the next entry, or returns `None` once the queue is drained
    pub async fn next<S: Storage + Send>(&self, storage: &mut S) -> Result<Option<EntryRecord>> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(None);
            }
            if let Some(entry) = storage.claim_next_entry()? {
                return Ok(Some(entry));
            }
            if !storage.has_busy_entries()? {
                tracing::info!("No more pending entries");
                return Ok(None);
            }
            if self.shutdown.sleep(self.poll_interval).await {
                return Ok(None);
            }
        }
    }
}

/// Result of an extraction run
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub stats: CrawlSnapshot,
}

/// Follower extraction over a shared SQLite queue
pub struct CrawlEngine {
    dispatcher: Arc<Dispatcher>,
    database_path: PathBuf,
    options: CrawlOptions,
    stats: Arc<CrawlStats>,
    shutdown: Arc<ShutdownSignal>,
}

impl CrawlEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        database_path: impl Into<PathBuf>,
        options: CrawlOptions,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            dispatcher,
            database_path: database_path.into(),
            options,
            stats: Arc::new(CrawlStats::new()),
            shutdown,
        }
    }

    pub fn stats(&self) -> &Arc<CrawlStats> {
        &self.stats
    }

    /// Opens a fresh connection to the crawl database
    pub fn open_storage(&self) -> Result<SqliteStorage> {
        SqliteStorage::new(&self.database_path)
    }

    /// Clears busy flags left behind by a crashed process
    ///
    /// Returns how many entries were released; their cursors are untouched.
    pub fn recover(&self) -> Result<usize> {
        let reset = self.open_storage()?.reset_busy_entries()?;
        if reset > 0 {
            tracing::warn!("Released {} entries left busy by a previous run", reset);
        }
        Ok(reset)
    }

    /// Adds users to the crawl queue
    ///
    /// Unknown users are looked up first; known users are queued only if
    /// they have no entry yet.
    ///
    /// # Arguments
    ///
    /// * `targets` - User ids or screen names
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of newly queued entries
    /// * `Err(HarvestError)` - A lookup or database operation failed
    pub async fn seed(&self, targets: &[String]) -> Result<usize> {
        let mut storage = self.open_storage()?;

        let mut ids = Vec::new();
        let mut names = Vec::new();
        for target in targets.iter().filter_map(|t| Target::parse(t)) {
            match target {
                Target::Id(id) => ids.push(id),
                Target::ScreenName(name) => names.push(name),
            }
        }

        let known = storage.known_user_ids(&ids)?;
        let mut to_queue: Vec<i64> = ids.iter().copied().filter(|id| known.contains(id)).collect();
        let missing_ids: Vec<String> = ids
            .iter()
            .filter(|id| !known.contains(id))
            .map(|id| id.to_string())
            .collect();

        let mut missing_names = Vec::new();
        for name in names {
            match storage.get_user_by_screen_name(&name)? {
                Some(user) => to_queue.push(user.id),
                None => missing_names.push(name),
            }
        }

        tracing::info!("Missing user ids: {:?}", missing_ids);
        tracing::info!("Missing screen names: {:?}", missing_names);

        let mut found = Vec::new();
        if !missing_names.is_empty() {
            found.extend(lookup_users(&self.dispatcher, &missing_names, true).await?);
        }
        if !missing_ids.is_empty() {
            found.extend(lookup_users(&self.dispatcher, &missing_ids, false).await?);
        }

        for user in &found {
            let Some(record) = UserRecord::from_json(user) else {
                tracing::warn!("Ignoring user without id: {}", user);
                continue;
            };
            storage.upsert_user(&record)?;
            to_queue.push(record.id);
        }

        let mut queued = 0;
        for user_id in to_queue {
            if storage.enqueue_user(user_id)? {
                queued += 1;
            }
        }
        self.stats.record_enqueued(queued as u64);

        tracing::info!("Queued {} new users ({} entries in total)", queued, storage.count_entries()?);
        Ok(queued)
    }

    /// Runs consumers until the queue is drained or shutdown is requested
    ///
    /// The run is journaled: it is closed as completed, interrupted (shutdown)
    /// or failed (a consumer hit an unrecoverable error).
    pub async fn run(&self, config_hash: &str) -> Result<CrawlReport> {
        self.recover()?;
        let run_id = self.open_storage()?.create_run(config_hash)?;
        tracing::info!(
            "Starting extraction run {} with {} consumers",
            run_id,
            self.options.consumers
        );

        let mut handles = Vec::with_capacity(self.options.consumers);
        for index in 0..self.options.consumers.max(1) {
            let consumer = Consumer {
                index,
                storage: self.open_storage()?,
                dispatcher: Arc::clone(&self.dispatcher),
                options: self.options.clone(),
                stats: Arc::clone(&self.stats),
                shutdown: Arc::clone(&self.shutdown),
                pending: PendingEntries::new(self.options.poll_interval, Arc::clone(&self.shutdown)),
            };
            handles.push(tokio::spawn(consumer.run()));
        }

        let mut failure = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(HarvestError::Io(std::io::Error::other(e.to_string()))),
            };
            if let Err(e) = result {
                tracing::error!("Consumer stopped: {}", e);
                failure.get_or_insert(e);
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else if self.shutdown.is_requested() {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        self.open_storage()?.finish_run(run_id, status)?;

        self.stats.log_progress();
        tracing::info!("Extraction run {} finished: {:?}", run_id, status);

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(CrawlReport {
            run_id,
            status,
            stats: self.stats.snapshot(),
        })
    }

    /// Crawls a single already-claimed entry on the given connection
    ///
    /// Returns `None` when the entry was given back because of shutdown.
    pub async fn download_user(
        &self,
        storage: &mut SqliteStorage,
        entry: EntryRecord,
    ) -> Result<Option<EntryOutcome>> {
        let consumer = Downloader {
            dispatcher: &self.dispatcher,
            options: &self.options,
            stats: &self.stats,
            shutdown: &self.shutdown,
        };
        consumer.download_user(storage, entry).await
    }
}

/// One consumer task with its own connection
struct Consumer {
    index: usize,
    storage: SqliteStorage,
    dispatcher: Arc<Dispatcher>,
    options: CrawlOptions,
    stats: Arc<CrawlStats>,
    shutdown: Arc<ShutdownSignal>,
    pending: PendingEntries,
}

impl Consumer {
    async fn run(mut self) -> Result<()> {
        tracing::debug!("Consumer {} started", self.index);

        while let Some(entry) = self.pending.next(&mut self.storage).await? {
            let downloader = Downloader {
                dispatcher: &self.dispatcher,
                options: &self.options,
                stats: &self.stats,
                shutdown: &self.shutdown,
            };
            let Some(outcome) = downloader.download_user(&mut self.storage, entry).await? else {
                break;
            };

            let finished = self.stats.record_outcome(outcome);
            if finished % PROGRESS_INTERVAL == 0 {
                self.stats.log_progress();
            }
        }

        tracing::debug!("Consumer {} finished", self.index);
        Ok(())
    }
}

/// Per-entry crawl logic, borrowed from an engine or a consumer
struct Downloader<'a> {
    dispatcher: &'a Dispatcher,
    options: &'a CrawlOptions,
    stats: &'a CrawlStats,
    shutdown: &'a ShutdownSignal,
}

impl Downloader<'_> {
    /// Pages through the followers of a claimed entry
    ///
    /// | Condition | Outcome |
    /// |-----------|---------|
    /// | More followers than the ceiling | `skipped`, no call made |
    /// | Cursor exhausted or all edges stored | `done` |
    /// | Empty page | `done` |
    /// | HTTP 401 `max_auth_attempts` times in a row | `failed` |
    /// | Page without `ids`, other HTTP rejection | `failed` |
    /// | Shutdown requested | claim released, `None` |
    /// | Dispatcher gave up (no worker, transport) | claim released, error |
    async fn download_user(
        &self,
        storage: &mut SqliteStorage,
        entry: EntryRecord,
    ) -> Result<Option<EntryOutcome>> {
        let user_id = entry.user_id;

        if entry.followers_count > self.options.max_followers {
            tracing::info!(
                "Too many followers for user {}: {} > {}",
                user_id,
                entry.followers_count,
                self.options.max_followers
            );
            storage.finish_entry(entry.id, EntryOutcome::Skipped, None)?;
            return Ok(Some(EntryOutcome::Skipped));
        }

        tracing::info!(
            "Getting followers of {} (cursor {}, {} expected)",
            user_id,
            entry.cursor,
            entry.followers_count
        );

        let endpoint = Endpoint::parse(FOLLOWERS_ENDPOINT);
        let mut cursor = entry.cursor;
        let mut auth_failures = 0u32;

        loop {
            let fetched = storage.count_edges(Some(user_id))? as i64;
            if cursor == 0 || fetched >= entry.followers_count {
                break;
            }
            if self.shutdown.is_requested() {
                storage.release_entry(entry.id)?;
                tracing::info!("Released user {} at cursor {}", user_id, cursor);
                return Ok(None);
            }

            let args = CallArgs::new()
                .with("user_id", user_id)
                .with("cursor", cursor);
            let body = match self.dispatcher.call(&endpoint, &args).await {
                Ok(response) => response.body,
                Err(e) if e.upstream_status() == Some(401) => {
                    auth_failures += 1;
                    if auth_failures >= self.options.max_auth_attempts {
                        let error = HarvestError::AuthorizationFailed {
                            user_id,
                            attempts: auth_failures,
                        };
                        return self.fail(storage, &entry, &error.to_string());
                    }
                    tracing::warn!(
                        "Not authorized for user {} (attempt {}/{})",
                        user_id,
                        auth_failures,
                        self.options.max_auth_attempts
                    );
                    continue;
                }
                Err(e @ HarvestError::UpstreamRejected { .. })
                | Err(e @ HarvestError::MalformedResponse { .. }) => {
                    return self.fail(storage, &entry, &e.to_string());
                }
                Err(e) => {
                    storage.release_entry(entry.id)?;
                    return Err(e);
                }
            };
            auth_failures = 0;

            let Some(ids) = body.get("ids").and_then(Value::as_array) else {
                return self.fail(storage, &entry, &format!("No ids in response: {}", body));
            };
            let ids: Vec<i64> = ids.iter().filter_map(Value::as_i64).collect();
            if ids.is_empty() {
                tracing::info!("No ids in page for user {}", user_id);
                break;
            }

            if self.options.recursive {
                self.discover(storage, &ids).await?;
            }

            let next_cursor = body
                .get("next_cursor")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let written = storage.record_page(entry.id, user_id, &ids, next_cursor)?;
            self.stats.record_edges(written as u64);
            cursor = next_cursor.max(0);

            tracing::info!(
                "Fetched {}/{} followers of {}",
                storage.count_edges(Some(user_id))?,
                entry.followers_count,
                user_id
            );
        }

        storage.finish_entry(entry.id, EntryOutcome::Done, None)?;
        tracing::info!("Done getting followers for {}", user_id);
        Ok(Some(EntryOutcome::Done))
    }

    fn fail(
        &self,
        storage: &mut SqliteStorage,
        entry: &EntryRecord,
        error: &str,
    ) -> Result<Option<EntryOutcome>> {
        tracing::error!("Giving up on user {}: {}", entry.user_id, error);
        storage.finish_entry(entry.id, EntryOutcome::Failed, Some(error))?;
        Ok(Some(EntryOutcome::Failed))
    }

    /// Looks up unseen followers and queues them, up to the frontier cap
    async fn discover(&self, storage: &mut SqliteStorage, ids: &[i64]) -> Result<()> {
        let mut room = match self.options.recursive_frontier_cap {
            Some(cap) => cap.saturating_sub(storage.count_entries()? as u64),
            None => u64::MAX,
        };
        if room == 0 {
            tracing::debug!("Frontier cap reached, not queueing new followers");
            return Ok(());
        }

        let known = storage.known_user_ids(ids)?;
        let unseen: Vec<String> = ids
            .iter()
            .filter(|id| !known.contains(id))
            .map(|id| id.to_string())
            .collect();
        if unseen.is_empty() {
            return Ok(());
        }

        let users = match lookup_users(self.dispatcher, &unseen, false).await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!("Could not look up {} new followers: {}", unseen.len(), e);
                return Ok(());
            }
        };

        let mut queued = 0;
        for user in &users {
            let Some(record) = UserRecord::from_json(user) else {
                continue;
            };
            storage.upsert_user(&record)?;
            if room > 0 && storage.enqueue_user(record.id)? {
                room -= 1;
                queued += 1;
            }
        }
        self.stats.record_enqueued(queued);
        tracing::debug!("Queued {} of {} new followers", queued, unseen.len());
        Ok(())
    }
}
