//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a JSON config file is given and exists, deep-merge it over the defaults
//! 3. Apply environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Configuration for the sonar server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind (`0` = auto-assign).
    pub port: u16,
    /// How often the reaper sweeps for idle connections.
    pub reap_interval_ms: u64,
    /// Connections silent for longer than this are evicted.
    pub idle_timeout_ms: u64,
    /// Per-connection outbound queue depth. A full queue counts as a failed delivery.
    pub send_queue_capacity: usize,
    /// Upper bound on a single socket write.
    pub write_timeout_ms: u64,
    /// Pending artifact notifications awaiting fan-out.
    pub dispatch_queue_capacity: usize,
    pub upload_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_upload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4000,
            reap_interval_ms: 5_000,
            idle_timeout_ms: 30_000,
            send_queue_capacity: 64,
            write_timeout_ms: 10_000,
            dispatch_queue_capacity: 1024,
            upload_dir: PathBuf::from("audios"),
            db_path: PathBuf::from("sonar.db"),
            max_upload_bytes: 50 * 1024 * 1024, // 50 MB
        }
    }
}

impl ServerConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("reap_interval_ms must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("idle_timeout_ms must be > 0".into()));
        }
        if self.send_queue_capacity == 0 || self.dispatch_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("queue capacities must be > 0".into()));
        }
        Ok(())
    }
}

/// Load the config from an optional JSON file plus env var overrides.
///
/// A missing file yields defaults; an unreadable or malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, everything else is replaced by `source`, and
/// `null` in `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides using `lookup` to read variables.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("HOST") {
        config.host = v;
    }
    if let Some(v) = read("PORT").and_then(|v| parse_or_warn("PORT", &v)) {
        config.port = v;
    }
    if let Some(v) = read("UPLOAD_DIR") {
        config.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = read("DB_PATH") {
        config.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("MAX_BYTES").and_then(|v| parse_or_warn("MAX_BYTES", &v)) {
        config.max_upload_bytes = v;
    }
    if let Some(v) = read("SONAR_REAP_INTERVAL_MS")
        .and_then(|v| parse_or_warn("SONAR_REAP_INTERVAL_MS", &v))
    {
        config.reap_interval_ms = v;
    }
    if let Some(v) = read("SONAR_IDLE_TIMEOUT_MS")
        .and_then(|v| parse_or_warn("SONAR_IDLE_TIMEOUT_MS", &v))
    {
        config.idle_timeout_ms = v;
    }
    if let Some(v) = read("SONAR_SEND_QUEUE").and_then(|v| parse_or_warn("SONAR_SEND_QUEUE", &v)) {
        config.send_queue_capacity = v;
    }
    if let Some(v) = read("SONAR_WRITE_TIMEOUT_MS")
        .and_then(|v| parse_or_warn("SONAR_WRITE_TIMEOUT_MS", &v))
    {
        config.write_timeout_ms = v;
    }
    if let Some(v) = read("SONAR_DISPATCH_QUEUE")
        .and_then(|v| parse_or_warn("SONAR_DISPATCH_QUEUE", &v))
    {
        config.dispatch_queue_capacity = v;
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "invalid numeric env var, ignoring");
    }
    parsed
}
