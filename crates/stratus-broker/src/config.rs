use std::time::Duration;

/// Configuration for the whole broker process.
///
/// All options use the `APP_` environment prefix (except `DATABASE_URL`).
/// Durations accept `90s`, `30m`, `24h`, or a bare number of seconds.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub status_port: u16,

    /// Use the in-memory store instead of PostgreSQL. Development only.
    pub db_in_memory: bool,
    pub database_url: Option<String>,

    /// Skip requeueing unfinished work at startup. Set on read-only
    /// replicas sharing a production database.
    pub disable_process_operations_in_progress: bool,

    /// Return raw failure descriptions from the last-operation endpoint.
    pub development_mode: bool,

    /// Wall-clock budget for a whole operation.
    pub operation_timeout: Duration,

    /// Default managed-runtime version stamped into provision payloads.
    pub runtime_version: String,

    pub workers_per_queue: usize,
    pub orchestration_workers: usize,
    pub polling_interval: Duration,
    pub update_processing_enabled: bool,

    pub provisioner_url: String,
    pub evaluator_url: String,
    pub accounts_url: String,
    pub resolver_url: String,
    pub audit_log_tenant: String,

    pub log_level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("APP_HOST", "0.0.0.0"),
            port: parse_var("APP_PORT", 8080)?,
            status_port: parse_var("APP_STATUS_PORT", 8071)?,
            db_in_memory: parse_bool("APP_DB_IN_MEMORY", false)?,
            database_url: std::env::var("DATABASE_URL").ok(),
            disable_process_operations_in_progress: parse_bool(
                "APP_DISABLE_PROCESS_OPERATIONS_IN_PROGRESS",
                false,
            )?,
            development_mode: parse_bool("APP_DEVELOPMENT_MODE", false)?,
            operation_timeout: parse_duration_var(
                "APP_OPERATION_TIMEOUT",
                Duration::from_secs(24 * 60 * 60),
            )?,
            runtime_version: env_or("APP_RUNTIME_VERSION", "1.24.0"),
            workers_per_queue: parse_var("APP_WORKERS_PER_QUEUE", 5)?,
            orchestration_workers: parse_var("APP_ORCHESTRATION_WORKERS", 3)?,
            polling_interval: parse_duration_var("APP_POLLING_INTERVAL", Duration::from_secs(60))?,
            update_processing_enabled: parse_bool("APP_UPDATE_PROCESSING_ENABLED", false)?,
            provisioner_url: env_or("APP_PROVISIONER_URL", "http://localhost:9100"),
            evaluator_url: env_or("APP_EVALUATOR_URL", "http://localhost:9101"),
            accounts_url: env_or("APP_ACCOUNTS_URL", "http://localhost:9102"),
            resolver_url: env_or("APP_RESOLVER_URL", "http://localhost:9103"),
            audit_log_tenant: env_or("APP_AUDIT_LOG_TENANT", "default-tenant"),
            log_level: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("APP_LOG_LEVEL").ok()),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

fn parse_duration_var(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => parse_duration(&value).ok_or_else(|| ConfigError::Invalid {
            key,
            value,
            reason: "expected a duration like 90s, 30m or 24h".to_string(),
        }),
    }
}

/// Parses `90s`, `30m`, `24h`, `250ms`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        None => (value, "s"),
        Some(split) => value.split_at(split),
    };
    let number: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 60 * 60)),
        _ => None,
    }
}
