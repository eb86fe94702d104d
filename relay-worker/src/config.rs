//! Configuration module for environment variable parsing.
//!
//! Every tunable has a default; a value that fails to parse is logged and
//! replaced by its default rather than aborting startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent delivery workers
    pub worker_concurrency: usize,

    /// Per-attempt HTTP timeout in milliseconds. A send that exceeds it
    /// counts as a transient `Timeout` failure.
    pub request_timeout_ms: u64,

    /// Base delay for exponential backoff: attempt `n` waits
    /// `base * 2^(n-1)` plus jitter.
    pub retry_base_delay_ms: u64,

    /// Upper bound of the uniform random jitter added to each backoff
    pub retry_jitter_ms: u64,

    /// Attempts per (event, subscription) chain before it is exhausted
    pub max_attempts: u32,

    /// How long a worker's claim on an attempt stays valid. An attempt whose
    /// lease expires goes back to the queue.
    pub lease_ttl_ms: u64,

    /// How often expired leases are reclaimed
    pub reaper_interval_ms: u64,

    /// Lifetime of a two-phase approval token in seconds
    pub approval_ttl_secs: u64,

    /// Directory for the JSONL stores. In-memory only when unset.
    pub data_dir: Option<PathBuf>,

    // =========================================================================
    // Web Server Configuration
    // =========================================================================
    /// Port for the admin API to listen on
    pub port: u16,

    /// Accept plain `http://` webhook URLs for non-loopback hosts
    pub allow_insecure_urls: bool,

    /// Optional per-host outbound rate limit (requests per second)
    pub throttle_per_host_rps: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_concurrency: 8,
            request_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_jitter_ms: 250,
            max_attempts: 3,
            lease_ttl_ms: 30_000,
            reaper_interval_ms: 1_000,
            approval_ttl_secs: 300,
            data_dir: None,
            port: 8080,
            allow_insecure_urls: false,
            throttle_per_host_rps: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let config = Config {
            worker_concurrency: parse_or("WORKER_CONCURRENCY", defaults.worker_concurrency),

            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),

            retry_base_delay_ms: parse_or("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),

            retry_jitter_ms: parse_or("RETRY_JITTER_MS", defaults.retry_jitter_ms),

            max_attempts: parse_or("MAX_ATTEMPTS", defaults.max_attempts),

            lease_ttl_ms: parse_or("LEASE_TTL_MS", defaults.lease_ttl_ms),

            reaper_interval_ms: parse_or("REAPER_INTERVAL_MS", defaults.reaper_interval_ms),

            approval_ttl_secs: parse_or("APPROVAL_TTL_SECS", defaults.approval_ttl_secs),

            data_dir: env::var("DATA_DIR")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),

            port: parse_or("PORT", defaults.port),

            allow_insecure_urls: parse_flag("ALLOW_INSECURE_URLS", defaults.allow_insecure_urls),

            throttle_per_host_rps: env::var("THROTTLE_PER_HOST_RPS")
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|rps| *rps > 0.0),
        };

        config.normalized()
    }

    /// Clamp values that would break the delivery invariants.
    pub fn normalized(mut self) -> Self {
        if self.worker_concurrency == 0 {
            warn!("worker_concurrency_zero_using_one");
            self.worker_concurrency = 1;
        }
        if self.max_attempts == 0 {
            warn!("max_attempts_zero_using_one");
            self.max_attempts = 1;
        }
        if self.lease_ttl_ms <= self.request_timeout_ms {
            let bumped = self.request_timeout_ms.saturating_mul(2);
            warn!(
                lease_ttl_ms = self.lease_ttl_ms,
                request_timeout_ms = self.request_timeout_ms,
                adjusted_lease_ttl_ms = bumped,
                "lease_ttl_not_above_timeout"
            );
            self.lease_ttl_ms = bumped;
        }
        if self.reaper_interval_ms == 0 {
            self.reaper_interval_ms = 1_000;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "invalid_config_value_using_default");
            default
        }
    }
}

/// Parse a boolean flag ("1", "true", "yes", "on" are truthy).
fn parse_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
