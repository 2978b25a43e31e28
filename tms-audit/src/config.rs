//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `TMS_AUDIT_`, nested keys separated by `__`)
//! 2. `./audit.toml` in the current working directory, or an explicit path
//! 3. Default values
//!
//! Values below the enforced minimums are not rejected at load time;
//! [`AuditConfig::normalized`] replaces them with defaults and logs a warning.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::sensitive::MaskStrategy;

/// Smallest accepted queue/buffer capacity
pub const MIN_BUFFER_SIZE: usize = 50;

/// Smallest accepted scheduled flush interval in seconds
pub const MIN_FLUSH_INTERVAL_SECS: u64 = 5;

const ENV_PREFIX: &str = "TMS_AUDIT_";
const DEFAULT_CONFIG_FILE: &str = "audit.toml";

/// Audit pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Service name used in logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Log level (`EnvFilter` directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deployment environment; selects the masking strategy
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Queue and audit buffer capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum entries per durable insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between scheduled flushes (also the worker flush ticker)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Number of batching workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound for the critical fallback admission in milliseconds
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,

    /// Deadline for the synchronous critical insert in milliseconds
    #[serde(default = "default_critical_timeout")]
    pub critical_timeout_ms: u64,

    /// Graceful drain deadline in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Batch insert retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff base in milliseconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Exponential backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Consecutive durable-insert failures that open the circuit
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Seconds the circuit stays open before a trial request is allowed
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_secs: u64,

    /// Seconds between health monitor checks
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Secret used to derive the AES-256-GCM key for `Encrypt` rules
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,

    /// Postgres backend configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

fn default_service_name() -> String {
    "tms-audit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_buffer_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    10
}

fn default_workers() -> usize {
    2
}

fn default_enqueue_timeout() -> u64 {
    5000
}

fn default_critical_timeout() -> u64 {
    5000
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_retry_max_delay() -> u64 {
    5000
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_cooldown() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    10
}

impl AuditConfig {
    /// Load configuration from `./audit.toml` (if present) and `TMS_AUDIT_` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file
    ///
    /// A missing file is not an error; defaults and environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut figment = Figment::new().merge(Serialized::defaults(AuditConfig::default()));

        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Returns the list of problems with this configuration.
    ///
    /// An empty list means every value is usable as-is.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.buffer_size < MIN_BUFFER_SIZE {
            problems.push(format!(
                "buffer_size {} is below the minimum of {}",
                self.buffer_size, MIN_BUFFER_SIZE
            ));
        }
        if self.batch_size == 0 {
            problems.push("batch_size must be greater than zero".to_string());
        }
        if self.flush_interval_secs < MIN_FLUSH_INTERVAL_SECS {
            problems.push(format!(
                "flush_interval_secs {} is below the minimum of {}",
                self.flush_interval_secs, MIN_FLUSH_INTERVAL_SECS
            ));
        }
        if self.workers == 0 {
            problems.push("workers must be greater than zero".to_string());
        }
        if self.environment.trim().is_empty() {
            problems.push("environment is required".to_string());
        }
        if self.circuit_failure_threshold == 0 {
            problems.push("circuit_failure_threshold must be greater than zero".to_string());
        }
        if matches!(&self.encryption_key, Some(k) if k.is_empty()) {
            problems.push("encryption_key must not be empty when set".to_string());
        }

        problems
    }

    /// Replace out-of-range values with their defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.buffer_size < MIN_BUFFER_SIZE {
            tracing::warn!(
                buffer_size = self.buffer_size,
                minimum = MIN_BUFFER_SIZE,
                "Buffer size below minimum, using default"
            );
            self.buffer_size = default_buffer_size();
        }
        if self.batch_size == 0 {
            self.batch_size = default_batch_size();
        }
        if self.flush_interval_secs < MIN_FLUSH_INTERVAL_SECS {
            tracing::warn!(
                flush_interval_secs = self.flush_interval_secs,
                minimum = MIN_FLUSH_INTERVAL_SECS,
                "Flush interval below minimum, using default"
            );
            self.flush_interval_secs = default_flush_interval();
        }
        if self.workers == 0 {
            self.workers = default_workers();
        }
        if self.environment.trim().is_empty() {
            self.environment = default_environment();
        }
        if self.circuit_failure_threshold == 0 {
            self.circuit_failure_threshold = default_circuit_failure_threshold();
        }
        if matches!(&self.encryption_key, Some(k) if k.is_empty()) {
            self.encryption_key = None;
        }
        self
    }

    /// Masking strategy and auto-detection flag for the configured environment.
    pub fn sensitive_profile(&self) -> (MaskStrategy, bool) {
        match self.environment.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => (MaskStrategy::Strict, true),
            "staging" | "stage" => (MaskStrategy::Default, true),
            "development" | "dev" => (MaskStrategy::Partial, true),
            "test" | "testing" => (MaskStrategy::Partial, false),
            other => {
                tracing::warn!(
                    environment = %other,
                    "Unknown environment, using default masking strategy"
                );
                (MaskStrategy::Default, true)
            }
        }
    }

    /// Scheduled flush interval
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Bound for critical fallback admission
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Deadline for the synchronous critical insert
    pub fn critical_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_timeout_ms)
    }

    /// Graceful drain deadline
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Circuit breaker cooldown
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    /// Health monitor tick
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            workers: default_workers(),
            enqueue_timeout_ms: default_enqueue_timeout(),
            critical_timeout_ms: default_critical_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown(),
            health_check_interval_secs: default_health_check_interval(),
            encryption_key: None,
            database: None,
        }
    }
}
