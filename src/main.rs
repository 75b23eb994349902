//! Quota-Harvester main entry point
//!
//! This is the command-line interface for the credential-pooled API harvester.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use quota_harvester::bulk::{BulkFetcher, BulkOptions, FetchOutcome, FileArtifactStore, LookupKind};
use quota_harvester::config::{load_config_or_default, validate, Config};
use quota_harvester::crawl::{load_targets, CrawlEngine, CrawlOptions};
use quota_harvester::credentials::{
    Credential, CredentialFilter, CredentialSource, JsonLinesCredentialStore,
};
use quota_harvester::dispatch::{
    Dispatcher, PageStrategy, RetryPolicy, StreamDispatcher, StreamPolicy,
};
use quota_harvester::output::{
    load_statistics, print_statistics, write_network, LimitReport, NetworkFormat,
};
use quota_harvester::shutdown::ShutdownSignal;
use quota_harvester::storage::{open_storage, Storage};
use quota_harvester::{CallArgs, Endpoint};
use tracing_subscriber::EnvFilter;

/// Quota-Harvester: a credential-pooled client for rate-limited APIs
///
/// Spreads calls over every stored credential, waits out rate limits,
/// crawls follower networks into SQLite and bulk-downloads items by id.
#[derive(Parser, Debug)]
#[command(name = "quota-harvester")]
#[command(version)]
#[command(about = "A credential-pooled client for rate-limited APIs", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage stored credentials
    #[command(subcommand)]
    Credentials(CredentialsCommand),

    /// Crawl the followers of the queued users
    Extract(ExtractArgs),

    /// Show extraction statistics from the database
    Status {
        /// Also list every entry that is no longer pending
        #[arg(long)]
        with_not_pending: bool,
    },

    /// Mark every pending entry as not pending
    Reset,

    /// Print the follower network
    Network {
        /// Print a JSON array instead of `follower -> followed` lines
        #[arg(long)]
        json: bool,
    },

    /// Bulk user downloads
    #[command(subcommand)]
    Users(BulkCommand),

    /// Bulk tweet downloads
    #[command(subcommand)]
    Tweets(BulkCommand),

    /// Issue a raw call to an endpoint
    Api(ApiArgs),

    /// Print items from a streaming endpoint as JSON lines
    Stream(StreamArgs),
}

#[derive(Subcommand, Debug)]
enum CredentialsCommand {
    /// List the stored credentials
    List,

    /// Add a credential
    Add {
        /// Label of the account
        user: String,
        #[arg(long)]
        consumer_key: String,
        #[arg(long)]
        consumer_secret: String,
        #[arg(long)]
        token_key: String,
        #[arg(long)]
        token_secret: String,
    },

    /// Remove every credential of an account
    Remove {
        /// Label of the account
        user: String,
    },

    /// Show the current rate limits of every credential
    Limits {
        /// Show every credential instead of the summed quota
        #[arg(long)]
        no_aggregate: bool,

        /// Include endpoints whose quota is untouched
        #[arg(long)]
        all: bool,

        /// Only show this endpoint (e.g. `/followers/ids`)
        endpoint: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Seed the queue with this user id or screen name
    #[arg(short, long)]
    user: Option<String>,

    /// Seed the queue from a file of user ids or screen names
    #[arg(short, long, conflicts_with = "user")]
    initfile: Option<PathBuf>,

    /// Also queue every newly seen follower
    #[arg(long)]
    recursive: bool,

    /// Number of concurrent consumers
    #[arg(long)]
    consumers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum BulkCommand {
    /// Download every id listed in a file (first column)
    GetAll(BulkArgs),
}

#[derive(Args, Debug)]
struct BulkArgs {
    /// File with one id per line
    file: PathBuf,

    /// Folder for downloaded items
    #[arg(short, long)]
    folder: Option<PathBuf>,

    /// Download items even when they are already present
    #[arg(short, long)]
    update: bool,

    /// Retry ids that previously failed
    #[arg(short, long)]
    retry: bool,

    /// The file lists screen names rather than user ids
    #[arg(long)]
    by_name: bool,
}

#[derive(Args, Debug)]
struct ApiArgs {
    /// Endpoint path, e.g. `statuses/user_timeline`
    endpoint: String,

    /// Call arguments as `key=value`
    #[arg(value_parser = parse_key_val)]
    args: Vec<(String, String)>,

    /// Follow `next_cursor`, reading items from this key (e.g. `ids`, `users`)
    #[arg(long, value_name = "ITEMS_KEY", conflicts_with = "id_pages")]
    cursor_pages: Option<String>,

    /// Follow descending ids (`max_id`); items under this key, or the body itself
    #[arg(long, value_name = "ITEMS_KEY", num_args = 0..=1, default_missing_value = "")]
    id_pages: Option<String>,

    /// Stop paginating once this many items were printed (-1 for all)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    max_count: i64,
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Streaming endpoint path, e.g. `statuses/filter`
    endpoint: String,

    /// Subscription arguments as `key=value`
    #[arg(value_parser = parse_key_val)]
    args: Vec<(String, String)>,

    /// Append items to this file instead of stdout
    #[arg(short, long)]
    file: Option<PathBuf>,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    Ok((key.trim_start_matches("--").to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let (config, config_hash) = load_config_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    validate(&config).context("Invalid configuration")?;
    tracing::debug!("Configuration loaded (hash: {})", config_hash);

    let shutdown = ShutdownSignal::shared();
    shutdown.install_ctrl_c();

    match cli.command {
        Command::Credentials(command) => handle_credentials(&config, command).await,
        Command::Extract(args) => handle_extract(&config, &config_hash, args, shutdown).await,
        Command::Status { with_not_pending } => handle_status(&config, with_not_pending),
        Command::Reset => handle_reset(&config),
        Command::Network { json } => handle_network(&config, json),
        Command::Users(BulkCommand::GetAll(args)) => {
            let kind = if args.by_name {
                LookupKind::ScreenNames
            } else {
                LookupKind::UserIds
            };
            handle_bulk(&config, kind, args, "users").await
        }
        Command::Tweets(BulkCommand::GetAll(args)) => {
            handle_bulk(&config, LookupKind::Tweets, args, "tweets").await
        }
        Command::Api(args) => handle_api(&config, args).await,
        Command::Stream(args) => handle_stream(&config, args, shutdown).await,
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("quota_harvester=info,warn"),
            1 => EnvFilter::new("quota_harvester=debug,info"),
            2 => EnvFilter::new("quota_harvester=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_writer(std::io::stderr)
        .init();
}

fn credential_store(config: &Config) -> JsonLinesCredentialStore {
    JsonLinesCredentialStore::new(&config.credentials.path)
}

fn dispatcher(config: &Config) -> anyhow::Result<Arc<Dispatcher>> {
    let dispatcher = Dispatcher::from_credentials(
        &credential_store(config),
        &config.api,
        RetryPolicy::from(&config.dispatcher),
    )?;
    if dispatcher.workers().is_empty() {
        bail!(
            "No credentials found in {}; add one with `credentials add`",
            config.credentials.path
        );
    }
    Ok(Arc::new(dispatcher))
}

async fn handle_credentials(config: &Config, command: CredentialsCommand) -> anyhow::Result<()> {
    let mut store = credential_store(config);

    match command {
        CredentialsCommand::List => {
            for credential in store.iter_credentials()? {
                println!("{}", credential.user);
            }
        }
        CredentialsCommand::Add {
            user,
            consumer_key,
            consumer_secret,
            token_key,
            token_secret,
        } => {
            store.create()?;
            let added = store.add(Credential {
                user: user.clone(),
                consumer_key,
                consumer_secret,
                token_key,
                token_secret,
            })?;
            if added {
                println!("Credentials added for {}", user);
            } else {
                println!("Credentials for {} already exist", user);
            }
        }
        CredentialsCommand::Remove { user } => {
            let removed = store.remove(&CredentialFilter::by_user(&user))?;
            println!("Removed {} credentials for {}", removed, user);
        }
        CredentialsCommand::Limits {
            no_aggregate,
            all,
            endpoint,
        } => {
            let dispatcher = dispatcher(config)?;
            let refreshed = dispatcher.refresh_all_limits().await;
            tracing::info!("Refreshed limits of {} workers", refreshed);

            let snapshots: Vec<_> = dispatcher
                .workers()
                .iter()
                .map(|w| (w.name().to_string(), w.limits_snapshot()))
                .collect();
            let report = LimitReport::from_tables(
                snapshots.iter().map(|(name, table)| (name.as_str(), table)),
            );

            match endpoint {
                Some(endpoint) => {
                    let endpoint = Endpoint::parse(&endpoint).path();
                    for (path, worker, usage) in report.lines(!no_aggregate, true) {
                        if path == endpoint {
                            println!("{}\t{}: {}/{} remaining", path, worker, usage.remaining, usage.limit);
                        }
                    }
                }
                None => report.print(!no_aggregate, all),
            }
        }
    }
    Ok(())
}

async fn handle_extract(
    config: &Config,
    config_hash: &str,
    args: ExtractArgs,
    shutdown: Arc<ShutdownSignal>,
) -> anyhow::Result<()> {
    let mut options = CrawlOptions::from(&config.crawl);
    options.recursive |= args.recursive;
    if let Some(consumers) = args.consumers {
        options.consumers = consumers;
    }

    let engine = CrawlEngine::new(
        dispatcher(config)?,
        &config.crawl.database_path,
        options,
        shutdown,
    );

    let targets = match (&args.user, &args.initfile) {
        (Some(user), _) => vec![user.clone()],
        (None, Some(file)) => load_targets(file)
            .with_context(|| format!("Failed to read {}", file.display()))?,
        (None, None) => {
            tracing::info!("Using pending users from the last session");
            Vec::new()
        }
    };
    if !targets.is_empty() {
        engine.seed(&targets).await?;
    }

    let report = engine.run(config_hash).await?;
    println!(
        "Run {} {}: {} collected, {} skipped, {} failed, {} edges",
        report.run_id,
        report.status.to_db_string(),
        report.stats.collected,
        report.stats.skipped,
        report.stats.failed,
        report.stats.edges
    );
    Ok(())
}

fn handle_status(config: &Config, with_not_pending: bool) -> anyhow::Result<()> {
    println!("Database: {}\n", config.crawl.database_path);
    let storage = open_storage(Path::new(&config.crawl.database_path))?;

    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    let entries = storage.list_entries(!with_not_pending)?;
    if !entries.is_empty() {
        println!("\nEntries:");
        for entry in entries {
            println!(
                "  {} user={} cursor={} followers={} state={}{}",
                entry.id,
                entry.user_id,
                entry.cursor,
                entry.followers_count,
                entry.state(),
                entry
                    .errors
                    .as_deref()
                    .map(|e| format!(" error={}", e))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn handle_reset(config: &Config) -> anyhow::Result<()> {
    let mut storage = open_storage(Path::new(&config.crawl.database_path))?;
    let reset = storage.reset_pending()?;
    println!("Marked {} entries as not pending", reset);
    Ok(())
}

fn handle_network(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(Path::new(&config.crawl.database_path))?;
    let format = if json {
        NetworkFormat::Json
    } else {
        NetworkFormat::Arrows
    };
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let written = write_network(&storage, format, &mut out)?;
    out.flush()?;
    tracing::info!("Wrote {} edges", written);
    Ok(())
}

async fn handle_bulk(
    config: &Config,
    kind: LookupKind,
    args: BulkArgs,
    default_subfolder: &str,
) -> anyhow::Result<()> {
    let ids = load_targets(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let folder = args
        .folder
        .unwrap_or_else(|| Path::new(&config.bulk.folder).join(default_subfolder));
    let mut options = BulkOptions::from(&config.bulk);
    options.update |= args.update;
    options.retry_failed |= args.retry;

    let fetcher = BulkFetcher::new(
        dispatcher(config)?,
        Arc::new(FileArtifactStore::new(&folder)),
        options,
    );

    let total = ids.len();
    let (mut found, mut missing, mut skipped, mut errors) = (0, 0, 0, 0);
    let mut outcomes = fetcher.fetch(kind, ids);
    while let Some(outcome) = outcomes.next().await {
        match &outcome {
            FetchOutcome::Found { id, .. } => {
                found += 1;
                tracing::debug!("Downloaded {}", id);
            }
            FetchOutcome::Missing { id } => {
                missing += 1;
                tracing::info!("Not found: {}", id);
            }
            FetchOutcome::Skipped { .. } => skipped += 1,
            FetchOutcome::Error { id, message } => {
                errors += 1;
                tracing::error!("Failed to fetch {}: {}", id, message);
            }
        }
        let done = found + missing + skipped + errors;
        if done % 100 == 0 {
            tracing::info!("Progress: {}/{}", done, total);
        }
    }

    println!(
        "{} downloaded, {} not found, {} skipped, {} errors (folder: {})",
        found,
        missing,
        skipped,
        errors,
        folder.display()
    );
    Ok(())
}

async fn handle_api(config: &Config, args: ApiArgs) -> anyhow::Result<()> {
    let dispatcher = dispatcher(config)?;
    let endpoint = Endpoint::parse(&args.endpoint);
    let call_args: CallArgs = args.args.into_iter().collect();

    let strategy = match (args.cursor_pages, args.id_pages) {
        (Some(key), _) => Some(PageStrategy::cursor(key)),
        (None, Some(key)) if key.is_empty() => Some(PageStrategy::timeline()),
        (None, Some(key)) => Some(PageStrategy::DescendingId {
            items_key: Some(key),
        }),
        (None, None) => None,
    };

    let Some(strategy) = strategy else {
        let response = dispatcher.call(&endpoint, &call_args).await?;
        println!("{}", serde_json::to_string(&response.body)?);
        return Ok(());
    };

    let mut items = dispatcher.paginate(endpoint, call_args, args.max_count, strategy);
    while let Some(item) = items.next().await {
        println!("{}", serde_json::to_string(&item?)?);
    }
    Ok(())
}

async fn handle_stream(
    config: &Config,
    args: StreamArgs,
    shutdown: Arc<ShutdownSignal>,
) -> anyhow::Result<()> {
    let dispatcher = StreamDispatcher::from_credentials(
        &credential_store(config),
        &config.api,
        StreamPolicy::from(&config.stream),
    )?;
    let endpoint = Endpoint::parse(&args.endpoint);
    let call_args: CallArgs = args.args.into_iter().collect();

    let mut out: Box<dyn Write> = match &args.file {
        Some(path) => Box::new(BufWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };

    let mut items = dispatcher.subscribe(endpoint, call_args).await?;
    loop {
        let item = tokio::select! {
            item = items.next() => item,
            _ = shutdown.wait() => None,
        };
        let Some(item) = item else {
            break;
        };
        writeln!(out, "{}", serde_json::to_string(&item?)?)?;
        out.flush()?;
    }
    Ok(())
}
