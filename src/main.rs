use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};

use helm_agent::{ProcessAgent, ProcessAgentConfig};
use helm_hub::{HubConfig, SessionHub};
use helm_server::ServerConfig;
use helm_settings::HelmSettings;
use helm_store::turns::TurnRepo;
use helm_store::{Database, SqlitePersistence};
use helm_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

/// Session hub for a coding agent, served over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "helm", version)]
struct Cli {
    /// Settings file. Defaults to ~/.helm/settings.json.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database file.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let db_path = helm_settings::expand_home(&settings.storage.database_path);
    let data_dir = db_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(helm_settings::helm_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let telemetry = Arc::new(init_telemetry(telemetry_config(&settings, &data_dir)));
    info!(version = env!("CARGO_PKG_VERSION"), "starting helm");

    let db = Database::open(&db_path).context("failed to open database")?;
    let stale = TurnRepo::new(db.clone())
        .close_stale()
        .context("failed to close stale turns")?;
    if stale > 0 {
        warn!(count = stale, "closed turns left open by a previous run");
    }

    let agent = ProcessAgent::new(ProcessAgentConfig {
        binary: settings.agent.binary.clone(),
        args: settings.agent.args.clone(),
        env: settings.agent.env.clone(),
        resume_flag: settings.agent.resume_flag.clone(),
    });
    let hub = SessionHub::with_metrics(
        Arc::new(agent),
        Arc::new(SqlitePersistence::new(db)),
        HubConfig {
            shutdown_timeout: Duration::from_millis(settings.hub.shutdown_timeout_ms),
            interactive_tools: settings.hub.interactive_tools.iter().cloned().collect(),
        },
        telemetry.metrics(),
    );

    let server = helm_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            ..ServerConfig::default()
        },
        hub.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to bind {}:{}",
            settings.server.host, settings.server.port
        )
    })?;
    info!(addr = %server.addr, "helm ready");

    let snapshots = spawn_metrics_snapshots(
        Arc::clone(&telemetry),
        Duration::from_secs(settings.telemetry.metrics_snapshot_secs.max(1)),
    );

    shutdown_signal().await;
    info!("shutdown requested");

    let report = hub.shutdown().await;
    info!(
        interrupted = report.interrupted,
        timed_out = report.timed_out,
        failed = report.failed,
        "hub stopped"
    );
    snapshots.abort();
    telemetry.snapshot_metrics();
    server.shutdown().await;
    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<HelmSettings> {
    let path = cli.config.clone().unwrap_or_else(helm_settings::settings_path);
    let mut settings = helm_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    if let Some(host) = &cli.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(db) = &cli.db {
        settings.storage.database_path = db.clone();
    }
    Ok(settings)
}

fn telemetry_config(settings: &HelmSettings, data_dir: &std::path::Path) -> TelemetryConfig {
    let telemetry = &settings.telemetry;
    TelemetryConfig {
        log_level: telemetry.log_level.parse().unwrap_or(Level::INFO),
        json: telemetry.json,
        log_to_sqlite: telemetry.persist_logs,
        log_db_path: data_dir.join("logs.db"),
        metrics_db_path: data_dir.join("metrics.db"),
        metrics_retention_days: telemetry.metrics_retention_days,
        ..TelemetryConfig::default()
    }
}

fn spawn_metrics_snapshots(
    telemetry: Arc<TelemetryGuard>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            telemetry.snapshot_metrics();
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let dir = std::env::temp_dir().join(format!("helm-cli-{}", std::process::id()));
        let cli = Cli::parse_from([
            "helm",
            "--config",
            dir.join("missing.json").to_str().unwrap(),
            "--host",
            "0.0.0.0",
            "--port",
            "4000",
            "--db",
            "/var/lib/helm/helm.db",
        ]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.storage.database_path, "/var/lib/helm/helm.db");
    }

    #[test]
    fn telemetry_files_live_next_to_the_database() {
        let settings = HelmSettings::default();
        let config = telemetry_config(&settings, std::path::Path::new("/data"));
        assert_eq!(config.log_db_path, PathBuf::from("/data/logs.db"));
        assert_eq!(config.metrics_db_path, PathBuf::from("/data/metrics.db"));
        assert_eq!(config.log_level, Level::INFO);
    }
}
