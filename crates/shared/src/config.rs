//! Application configuration management.

use std::time::Duration;

use serde::Deserialize;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Commit pipeline tuning.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Log block sealing.
    #[serde(default)]
    pub log_blocks: LogBlockConfig,
    /// Hard deletion of soft-deleted ledgers.
    #[serde(default)]
    pub bucket_cleanup: BucketCleanupConfig,
    /// Logging output.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection establishment timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    10
}

/// Settings of the transaction commit pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Budget for a mutating call before the caller gets a timeout.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Maximum number of elements accepted in one bulk request.
    #[serde(default = "default_bulk_max_size")]
    pub bulk_max_size: usize,
    /// Concurrency of non-atomic parallel bulks.
    #[serde(default = "default_bulk_parallelism")]
    pub bulk_parallelism: usize,
    /// Maximum wait for one lock acquisition.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// How many times a failed lock acquisition is retried.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    /// Base delay between lock retries, doubled on each attempt.
    #[serde(default = "default_lock_retry_backoff")]
    pub lock_retry_backoff_ms: u64,
    /// TTL of cached ledger definitions.
    #[serde(default = "default_registry_cache_ttl")]
    pub registry_cache_ttl_secs: u64,
}

fn default_response_timeout() -> u64 {
    30_000
}

fn default_bulk_max_size() -> usize {
    100
}

fn default_bulk_parallelism() -> usize {
    10
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_lock_retry_attempts() -> u32 {
    3
}

fn default_lock_retry_backoff() -> u64 {
    50
}

fn default_registry_cache_ttl() -> u64 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            bulk_max_size: default_bulk_max_size(),
            bulk_parallelism: default_bulk_parallelism(),
            lock_timeout_ms: default_lock_timeout(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_backoff_ms: default_lock_retry_backoff(),
            registry_cache_ttl_secs: default_registry_cache_ttl(),
        }
    }
}

impl LedgerConfig {
    /// Response timeout as a [`Duration`].
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Lock acquisition timeout as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Base retry delay as a [`Duration`].
    #[must_use]
    pub const fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    /// Lifetime of cached ledger definitions.
    #[must_use]
    pub const fn registry_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_cache_ttl_secs)
    }
}

/// Log block sealing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogBlockConfig {
    /// Whether the block runner is started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of log entries per block.
    #[serde(default = "default_block_size")]
    pub max_size: u64,
    /// Seconds between two sealing passes.
    #[serde(default = "default_block_interval")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> u64 {
    1_000
}

fn default_block_interval() -> u64 {
    10
}

impl LogBlockConfig {
    /// Sealing interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LogBlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_block_size(),
            interval_secs: default_block_interval(),
        }
    }
}

/// Bucket cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketCleanupConfig {
    /// Whether the cleanup runner is started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Grace period between soft and hard deletion, in seconds.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Seconds between two cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

fn default_retention() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl BucketCleanupConfig {
    /// Cleanup interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention period as a [`Duration`].
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for BucketCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: default_retention(),
            interval_secs: default_cleanup_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Fallback filter when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or holds invalid values.
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let run_mode = std::env::var("TALLY_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.ledger.bulk_max_size == 0 {
            return Err(config::ConfigError::Message(
                "ledger.bulk_max_size must be greater than zero".into(),
            ));
        }
        if self.ledger.bulk_parallelism == 0 {
            return Err(config::ConfigError::Message(
                "ledger.bulk_parallelism must be greater than zero".into(),
            ));
        }
        if self.log_blocks.max_size == 0 {
            return Err(config::ConfigError::Message(
                "log_blocks.max_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
