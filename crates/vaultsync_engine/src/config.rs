//! Configuration for the sync engine.

use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vaultsync_protocol::DeviceId;

/// Configuration for the engine.
///
/// Only `apiUrl`, `autoSync` and `syncIntervalMs` are read from JSON; the
/// remaining tunables are set through the builder methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Relay base URL.
    pub api_url: String,
    /// Sync on connect, on a timer and after local edits.
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    /// Period of the scheduler timer.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Device id (unique per install).
    #[serde(skip, default = "DeviceId::generate")]
    pub device_id: DeviceId,
    /// Per-call network timeout.
    #[serde(skip, default = "default_timeout")]
    pub timeout: Duration,
    /// Bound on concurrent requests within one pass.
    #[serde(skip, default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Reconnect policy for the notification channel.
    #[serde(skip)]
    pub reconnect: ReconnectPolicy,
    /// Retry configuration for scheduled passes.
    #[serde(skip)]
    pub retry: RetryConfig,
    /// Number of recent failures kept in the status.
    #[serde(skip, default = "default_max_recent_errors")]
    pub max_recent_errors: usize,
}

fn default_auto_sync() -> bool {
    true
}

fn default_sync_interval_ms() -> u64 {
    60_000
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_requests() -> usize {
    4
}

fn default_max_recent_errors() -> usize {
    32
}

impl EngineConfig {
    /// Creates a new configuration with defaults.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            auto_sync: default_auto_sync(),
            sync_interval_ms: default_sync_interval_ms(),
            device_id: DeviceId::generate(),
            timeout: default_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            reconnect: ReconnectPolicy::default(),
            retry: RetryConfig::default(),
            max_recent_errors: default_max_recent_errors(),
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("apiUrl must not be empty".into()));
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid("syncIntervalMs must be > 0".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the scheduler period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Sets the device id.
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    /// Enables or disables auto-sync.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Sets the scheduler period.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the bound on concurrent requests within a pass.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Exponential backoff with full jitter for notification-channel reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay ceiling for the first attempt.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Give up after this many failed attempts. `None` keeps trying; every
    /// attempt is still announced with a `Reconnecting` event.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Creates a policy with the given base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_attempts: None,
        }
    }

    /// Limits the number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns `min(cap, base * 2^attempt)`.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Picks a delay uniformly in `[0, ceiling]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Returns true if another attempt is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn engine_config_builder() {
        let device = DeviceId::from_bytes([2u8; 16]);
        let config = EngineConfig::new("https://relay.example.com")
            .with_device_id(device)
            .with_auto_sync(false)
            .with_sync_interval(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(60))
            .with_max_concurrent_requests(8);

        assert_eq!(config.device_id, device);
        assert!(!config.auto_sync);
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_requests, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_options_and_defaults() {
        let config = EngineConfig::from_json(
            r#"{"apiUrl": "https://relay.example.com", "syncIntervalMs": 15000, "theme": "dark"}"#,
        )
        .unwrap();

        assert_eq!(config.api_url, "https://relay.example.com");
        assert!(config.auto_sync);
        assert_eq!(config.sync_interval_ms, 15_000);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.max_recent_errors, 32);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = EngineConfig::from_json(r#"{"apiUrl": "x", "syncIntervalMs": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(matches!(
            EngineConfig::from_json(r#"{"autoSync": true}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"apiUrl": "http://localhost:8080", "autoSync": false}}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert!(!config.auto_sync);
        assert_eq!(config.sync_interval_ms, 60_000);

        assert!(matches!(
            EngineConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn reconnect_ceiling_doubles_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.ceiling_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.ceiling_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.ceiling_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.ceiling_for_attempt(40), Duration::from_secs(30));

        for attempt in 0..8 {
            assert!(policy.delay_for_attempt(attempt) <= policy.ceiling_for_attempt(attempt));
        }
    }

    #[test]
    fn reconnect_attempt_limit() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.allows(1_000));

        let limited = ReconnectPolicy::default().with_max_attempts(2);
        assert!(limited.allows(1));
        assert!(!limited.allows(2));
    }
}
