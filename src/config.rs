use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const DEFAULT_COMPLETED_TTL_DAYS: u64 = 7;

/// Tunables of the idempotency mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencySettings {
    /// How long COMPLETED records stay replayable, counted from creation.
    pub completed_ttl: Duration,
    /// How long a PENDING record may go without updates before it is reclaimed.
    pub pending_ttl: Duration,
    pub sweep_interval: Duration,
    pub wait_budget: Duration,
    pub wait_step: Duration,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self::new(None, None, None, None, None)
    }
}

impl IdempotencySettings {
    pub fn new(
        completed_ttl_days: Option<i64>,
        pending_ttl_ms: Option<i64>,
        sweep_interval_ms: Option<i64>,
        wait_budget_ms: Option<i64>,
        wait_step_ms: Option<i64>,
    ) -> Self {
        Self {
            completed_ttl: days(normalize(completed_ttl_days, DEFAULT_COMPLETED_TTL_DAYS))
                .unwrap_or(Duration::from_secs(DEFAULT_COMPLETED_TTL_DAYS * SECONDS_PER_DAY)),
            pending_ttl: Duration::from_millis(normalize(pending_ttl_ms, 5 * 60 * 1000)),
            sweep_interval: Duration::from_millis(normalize(sweep_interval_ms, 60 * 1000)),
            wait_budget: Duration::from_millis(normalize(wait_budget_ms, 1000)),
            wait_step: Duration::from_millis(normalize(wait_step_ms, 50)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: usize,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl RateLimitSettings {
    pub fn new(max_requests: Option<i64>, window_ms: Option<i64>) -> Self {
        Self {
            max_requests: normalize(max_requests, 100) as usize,
            window: Duration::from_millis(normalize(window_ms, 60_000)),
        }
    }
}

/// `None` when the day count does not fit in seconds.
fn days(count: u64) -> Option<Duration> {
    count.checked_mul(SECONDS_PER_DAY).map(Duration::from_secs)
}

fn normalize(value: Option<i64>, default_value: u64) -> u64 {
    match value {
        Some(v) if v > 0 => v as u64,
        _ => default_value,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub log_level: String,
    /// PostgreSQL URL. `None` selects the in-memory idempotency store.
    pub database_url: Option<String>,
    pub idempotency: IdempotencySettings,
    pub rate_limit: RateLimitSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(env_lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env_lookup(name).filter(|value| !value.trim().is_empty());
        let number = |name: &str| lookup(name).and_then(|value| value.trim().parse::<i64>().ok());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::new(format!("PORT must be a port number, got {raw}")))?,
            None => 4000,
        };

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            database_url: lookup("DATABASE_URL"),
            idempotency: IdempotencySettings::new(
                number("IDEMP_TTL_DAYS"),
                number("IDEMP_PENDING_TTL_MS"),
                number("IDEMP_SWEEP_INTERVAL_MS"),
                number("IDEMP_WAIT_MAX_MS"),
                number("IDEMP_WAIT_STEP_MS"),
            ),
            rate_limit: RateLimitSettings::new(
                number("RATE_LIMIT_MAX"),
                number("RATE_LIMIT_WINDOW_MS"),
            ),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
