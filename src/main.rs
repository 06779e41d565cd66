use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sonar_server::config::load_config;
use sonar_store::Database;
use sonar_telemetry::{init_telemetry, parse_level, LogFormat, TelemetryConfig};

/// Live audio upload notifications over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "sonar", version)]
struct Cli {
    /// JSON config file. Missing file means defaults.
    #[arg(long, default_value = "sonar.json")]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Default level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

/// Install the global subscriber. Returns whether this call installed it.
fn init_logging(level: &str, json: bool) -> anyhow::Result<bool> {
    let log_level = parse_level(level).with_context(|| format!("invalid log level: {level}"))?;
    let installed = init_telemetry(&TelemetryConfig {
        log_level,
        format: if json { LogFormat::Json } else { LogFormat::Pretty },
        ..TelemetryConfig::default()
    });
    if !installed {
        tracing::warn!("tracing subscriber already installed, keeping the existing one");
    }
    Ok(installed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _ = init_logging(&cli.log_level, cli.log_json)?;

    let mut config = load_config(Some(&cli.config))
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate().context("invalid configuration")?;

    let db = Database::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let handle = sonar_server::start(config, db)
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.addr, "sonar ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
