//! Configuration module for Quota-Harvester
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use quota_harvester::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvester.toml")).unwrap();
//! println!("Crawl database: {}", config.crawl.database_path);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, BulkConfig, Config, CrawlConfig, CredentialsConfig, DispatcherConfig,
    StreamConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_or_default, load_config_with_hash,
    parse_config,
};
pub use validation::validate;
