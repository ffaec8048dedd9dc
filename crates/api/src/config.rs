//! Application configuration loaded from environment variables.

use std::time::Duration;

use coordination::DEFAULT_GATE_HOLD;
use issuance::IssuanceConfig;
use saga::{ReconcilerConfig, RetryPolicy};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: Postgres ledger; in-memory when unset
/// - `REDIS_URL`: Redis dedup cache and lease lock; in-memory when unset
/// - `GATE_HOLD_MS`, `LOCK_WAIT_MS`, `LOCK_HOLD_MS`
/// - `PAYMENT_BASE_URL`, `PAYMENT_SECRET_KEY` (scripted provider when unset),
///   `PAYMENT_TIMEOUT_MS`, `PAYMENT_MAX_ATTEMPTS`
/// - `EVENT_SWEEP_INTERVAL_SECS`, `RECONCILE_INTERVAL_SECS`,
///   `RECONCILE_STALE_AFTER_SECS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub gate_hold: Duration,
    pub lock_wait: Duration,
    pub lock_hold: Duration,
    pub payment_base_url: String,
    pub payment_secret_key: Option<String>,
    pub payment_timeout: Duration,
    pub payment_max_attempts: u32,
    pub event_sweep_interval: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_stale_after: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from any key lookup. Unparseable values fall back
    /// to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| parsed(key).map_or(default, Duration::from_millis);
        let secs = |key: &str, default: Duration| parsed(key).map_or(default, Duration::from_secs);

        Self {
            host: non_empty("HOST").unwrap_or(defaults.host),
            port: non_empty("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: non_empty("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match non_empty("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            gate_hold: millis("GATE_HOLD_MS", defaults.gate_hold),
            lock_wait: millis("LOCK_WAIT_MS", defaults.lock_wait),
            lock_hold: millis("LOCK_HOLD_MS", defaults.lock_hold),
            payment_base_url: non_empty("PAYMENT_BASE_URL").unwrap_or(defaults.payment_base_url),
            payment_secret_key: non_empty("PAYMENT_SECRET_KEY"),
            payment_timeout: millis("PAYMENT_TIMEOUT_MS", defaults.payment_timeout),
            payment_max_attempts: parsed("PAYMENT_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.payment_max_attempts),
            event_sweep_interval: secs("EVENT_SWEEP_INTERVAL_SECS", defaults.event_sweep_interval),
            reconcile_interval: secs("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval),
            reconcile_stale_after: secs("RECONCILE_STALE_AFTER_SECS", defaults.reconcile_stale_after),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn issuance(&self) -> IssuanceConfig {
        IssuanceConfig {
            lock_wait: self.lock_wait,
            lock_hold: self.lock_hold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.payment_max_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            stale_after: self.reconcile_stale_after,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let issuance = IssuanceConfig::default();
        let reconciler = ReconcilerConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            redis_url: None,
            gate_hold: DEFAULT_GATE_HOLD,
            lock_wait: issuance.lock_wait,
            lock_hold: issuance.lock_hold,
            payment_base_url: "https://api.tosspayments.com".to_string(),
            payment_secret_key: None,
            payment_timeout: Duration::from_secs(10),
            payment_max_attempts: RetryPolicy::default().max_attempts,
            event_sweep_interval: Duration::from_secs(60),
            reconcile_interval: reconciler.interval,
            reconcile_stale_after: reconciler.stale_after,
        }
    }
}
