//! Configuration for the engine and its transport.
//!
//! This module provides the [`Config`] struct for venue endpoints, calibration
//! timing and buffer limits, and the [`ReconnectConfig`] backoff policy used
//! by the WebSocket feed.

use std::time::Duration;

/// Venue environment (production or sandbox)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Production environment
    #[default]
    Production,
    /// Sandbox environment
    Sandbox,
}

impl Environment {
    /// Get the base URL for REST API
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            Environment::Production => "https://api.kucoin.com",
            Environment::Sandbox => "https://openapi-sandbox.kucoin.com",
        }
    }
}

/// Configuration of the order book engine
///
/// # Example
///
/// ```rust
/// use l2book::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_environment(l2book::config::Environment::Sandbox)
///     .with_stale_threshold(Duration::from_secs(30))
///     .with_max_buffered_deltas(50_000);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Venue environment
    environment: Environment,

    /// HTTP request timeout
    timeout: Duration,

    /// Age after which an instrument's summary is refreshed over REST
    stale_threshold: Duration,

    /// Wait between subscribing and requesting snapshots so that early deltas
    /// are already being buffered when the snapshot is taken
    snapshot_settle_delay: Duration,

    /// Per-instrument calibration buffer capacity
    max_buffered_deltas: usize,

    /// Symbols per fee request
    fee_batch_size: usize,

    /// WebSocket reconnection policy
    reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self {
            environment: Environment::default(),
            timeout: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(60),
            snapshot_settle_delay: Duration::from_millis(100),
            max_buffered_deltas: 10_000,
            fee_batch_size: 10,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Set the venue environment
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the HTTP request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the staleness threshold used by periodic refresh
    #[must_use]
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set the delay between subscribing and fetching snapshots
    #[must_use]
    pub fn with_snapshot_settle_delay(mut self, delay: Duration) -> Self {
        self.snapshot_settle_delay = delay;
        self
    }

    /// Set the per-instrument calibration buffer capacity (minimum 1)
    #[must_use]
    pub fn with_max_buffered_deltas(mut self, max: usize) -> Self {
        self.max_buffered_deltas = max.max(1);
        self
    }

    /// Set the number of symbols per fee request (minimum 1)
    #[must_use]
    pub fn with_fee_batch_size(mut self, size: usize) -> Self {
        self.fee_batch_size = size.max(1);
        self
    }

    /// Set the WebSocket reconnection policy
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Get the environment
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Get the REST API base URL
    pub fn rest_base_url(&self) -> &'static str {
        self.environment.rest_base_url()
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the staleness threshold
    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Get the snapshot settle delay
    pub fn snapshot_settle_delay(&self) -> Duration {
        self.snapshot_settle_delay
    }

    /// Get the calibration buffer capacity
    pub fn max_buffered_deltas(&self) -> usize {
        self.max_buffered_deltas
    }

    /// Get the fee batch size
    pub fn fee_batch_size(&self) -> usize {
        self.fee_batch_size
    }

    /// Get the reconnection policy
    pub fn reconnect(&self) -> &ReconnectConfig {
        &self.reconnect
    }
}

/// Configuration for reconnection behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (0 = infinite)
    pub max_retries: u32,
    /// Initial delay between reconnection attempts
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnection attempts
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new reconnect config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries (0 = infinite)
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay in milliseconds
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Set maximum delay in milliseconds
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries == 0 || attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::new();
        assert_eq!(config.environment(), Environment::Production);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.stale_threshold(), Duration::from_secs(60));
        assert_eq!(config.snapshot_settle_delay(), Duration::from_millis(100));
        assert_eq!(config.fee_batch_size(), 10);
    }

    #[test]
    fn test_sandbox_environment() {
        let config = Config::new().with_environment(Environment::Sandbox);
        assert!(config.rest_base_url().contains("sandbox"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = Config::new()
            .with_timeout(Duration::from_secs(30))
            .with_max_buffered_deltas(0)
            .with_fee_batch_size(0)
            .with_snapshot_settle_delay(Duration::ZERO);

        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_buffered_deltas(), 1);
        assert_eq!(config.fee_batch_size(), 1);
        assert_eq!(config.snapshot_settle_delay(), Duration::ZERO);
    }

    #[test]
    fn test_reconnect_config_builder() {
        let config = ReconnectConfig::new()
            .max_retries(5)
            .initial_delay_ms(50)
            .max_delay_ms(10_000)
            .backoff_multiplier(1.5);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 50);
        assert!(config.allows(4));
        assert!(!config.allows(5));
        assert!(ReconnectConfig::new().max_retries(0).allows(1_000));
    }

    #[test]
    fn test_delay_calculation() {
        let config = ReconnectConfig::new()
            .initial_delay_ms(100)
            .backoff_multiplier(2.0)
            .max_delay_ms(1000);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(1000));
    }
}
