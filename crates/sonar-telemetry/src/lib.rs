use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output format for log lines on stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "sonar_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Parse a level name as accepted on the command line (`info`, `DEBUG`, ...).
pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Returns `false` when a subscriber was already installed (e.g. by a test harness).
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.filter_directives(), "info");
    }

    #[test]
    fn module_overrides_appended() {
        let cfg = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("sonar_server".into(), Level::DEBUG),
                ("tower_http".into(), Level::ERROR),
            ],
            format: LogFormat::Json,
        };
        assert_eq!(
            cfg.filter_directives(),
            "warn,sonar_server=debug,tower_http=error"
        );
    }

    #[test]
    fn parse_level_accepts_any_case() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn second_init_is_reported() {
        let cfg = TelemetryConfig::default();
        let _ = init_telemetry(&cfg);
        assert!(!init_telemetry(&cfg));
    }
}
