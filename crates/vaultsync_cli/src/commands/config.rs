//! Config command implementation.

use serde::Serialize;
use std::path::Path;
use vaultsync_engine::{ConfigError, EngineConfig};

/// Effective engine configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReport {
    /// File the configuration was read from.
    pub path: String,
    /// Relay base URL.
    pub api_url: String,
    /// Automatic sync enabled.
    pub auto_sync: bool,
    /// Scheduler period in milliseconds.
    pub sync_interval_ms: u64,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u128,
    /// Concurrent requests per pass.
    pub max_concurrent_requests: usize,
    /// Attempts for scheduled passes.
    pub retry_attempts: u32,
    /// Reconnect delay ceiling in milliseconds.
    pub reconnect_cap_ms: u128,
    /// Size of the recent-errors list.
    pub max_recent_errors: usize,
}

impl ConfigReport {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = EngineConfig::load(path)?;
        Ok(Self {
            path: path.display().to_string(),
            api_url: config.api_url.clone(),
            auto_sync: config.auto_sync,
            sync_interval_ms: config.sync_interval_ms,
            timeout_ms: config.timeout.as_millis(),
            max_concurrent_requests: config.max_concurrent_requests,
            retry_attempts: config.retry.max_attempts,
            reconnect_cap_ms: config.reconnect.cap.as_millis(),
            max_recent_errors: config.max_recent_errors,
        })
    }
}

/// Runs the config command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = ConfigReport::load(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

fn print_text_output(report: &ConfigReport) {
    println!("Configuration: {}", report.path);
    println!("  Relay URL:        {}", report.api_url);
    println!("  Auto sync:        {}", report.auto_sync);
    println!("  Sync interval:    {} ms", report.sync_interval_ms);
    println!();
    println!("Engine defaults:");
    println!("  Request timeout:  {} ms", report.timeout_ms);
    println!("  Max concurrency:  {}", report.max_concurrent_requests);
    println!("  Retry attempts:   {}", report.retry_attempts);
    println!("  Reconnect cap:    {} ms", report.reconnect_cap_ms);
    println!("  Recent errors:    {}", report.max_recent_errors);
}
