use crate::config::types::{ApiConfig, BulkConfig, Config, CrawlConfig, StreamConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_credentials_path(&config.credentials.path)?;
    validate_crawl_config(&config.crawl)?;
    validate_bulk_config(&config.bulk)?;
    validate_stream_config(&config.stream)?;
    Ok(())
}

/// Validates API configuration
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    for (name, value) in [("base-url", &config.base_url), ("stream-url", &config.stream_url)] {
        let url = Url::parse(value)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {}: {}", name, e)))?;

        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ConfigError::Validation(format!(
                "{} must use HTTP or HTTPS, got '{}'",
                name, value
            )));
        }

        if url.query().is_some() {
            return Err(ConfigError::Validation(format!(
                "{} must not contain a query string, got '{}'",
                name, value
            )));
        }
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_credentials_path(path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::Validation(
            "credentials path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validates crawl configuration
fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.consumers < 1 || config.consumers > 256 {
        return Err(ConfigError::Validation(format!(
            "consumers must be between 1 and 256, got {}",
            config.consumers
        )));
    }

    if config.max_followers < 0 {
        return Err(ConfigError::Validation(format!(
            "max-followers must be >= 0, got {}",
            config.max_followers
        )));
    }

    if config.max_auth_attempts < 1 {
        return Err(ConfigError::Validation(
            "max-auth-attempts must be >= 1".to_string(),
        ));
    }

    if config.poll_interval_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "poll-interval-ms must be >= 10ms, got {}ms",
            config.poll_interval_ms
        )));
    }

    Ok(())
}

/// Validates bulk fetcher configuration
fn validate_bulk_config(config: &BulkConfig) -> Result<(), ConfigError> {
    // The lookup endpoints accept at most 100 ids per call
    if config.batch_size < 1 || config.batch_size > 100 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be between 1 and 100, got {}",
            config.batch_size
        )));
    }

    if config.parallelism < 1 {
        return Err(ConfigError::Validation(
            "parallelism must be >= 1".to_string(),
        ));
    }

    if config.folder.is_empty() {
        return Err(ConfigError::Validation(
            "bulk folder cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_stream_config(config: &StreamConfig) -> Result<(), ConfigError> {
    if config.reconnect && config.hangup_window_secs == 0 {
        return Err(ConfigError::Validation(
            "hangup-window-secs must be >= 1 when reconnect is enabled".to_string(),
        ));
    }
    Ok(())
}
