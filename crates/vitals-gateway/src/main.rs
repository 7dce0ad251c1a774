//! # vitals-gateway
//!
//! Gateway binary: loads settings, builds the connection manager, and serves
//! the HTTP/WebSocket endpoints until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use vitals_realtime::ConnectionManager;
use vitals_server::{ServerConfig, VitalsServer, realtime_config};
use vitals_settings::VitalsSettings;

/// Vitals real-time gateway.
#[derive(Parser, Debug)]
#[command(name = "vitals-gateway", about = "Vitals real-time gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(vitals_settings::settings_path)
    }

    /// Layer command-line flags over file and environment settings.
    fn apply(&self, settings: &mut VitalsSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_settings(cli: &Cli) -> Result<VitalsSettings> {
    let path = cli.settings_path();
    let mut settings = vitals_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    vitals_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = vitals_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let manager = Arc::new(ConnectionManager::new(realtime_config(&settings.realtime)));
    manager.start_background_tasks();

    let server = VitalsServer::new(
        ServerConfig::from(&settings.server),
        Arc::clone(&manager),
        metrics,
    );
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!(
        heartbeat_secs = settings.realtime.heartbeat_interval_secs,
        timeout_secs = settings.realtime.connection_timeout_secs,
        "Vitals gateway listening on http://{addr}"
    );

    server.shutdown().wait_for_signal().await;

    tracing::info!("Shutting down...");
    shutdown(&server, &manager, handle).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Stop accepting first, then close live connections, then wait for the
/// serve task.
async fn shutdown(server: &VitalsServer, manager: &ConnectionManager, handle: JoinHandle<()>) {
    server.shutdown().shutdown();
    manager.shutdown().await;
    server.shutdown().drain(vec![handle], None).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_listener_and_closes_connections() {
        use vitals_realtime::{ChannelTransport, CloseReason};

        let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let manager = Arc::new(ConnectionManager::default());
        manager.start_background_tasks();
        let server = VitalsServer::new(ServerConfig::default(), Arc::clone(&manager), metrics);
        let (addr, handle) = server.listen().await.unwrap();

        let (transport, _rx) = ChannelTransport::new(4);
        let _ = manager.connect(transport.clone(), "u1", "u1", None).await;

        shutdown(&server, &manager, handle).await;

        assert!(server.shutdown().is_shutting_down());
        assert!(!manager.is_running());
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(transport.close_reason(), Some(CloseReason::ServerShutdown));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        let (late, _late_rx) = ChannelTransport::new(4);
        let _ = manager.connect(late.clone(), "late", "late", None).await;
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(late.close_reason(), Some(CloseReason::ServerShutdown));
    }

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["vitals-gateway"]);
        let mut settings = VitalsSettings::default();
        let before = settings.server.port;
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, before);
        assert_eq!(settings.logging.level, VitalsSettings::default().logging.level);
    }

    #[test]
    fn cli_overrides_host_port_and_level() {
        let cli = Cli::parse_from([
            "vitals-gateway",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--log-level",
            "debug",
        ]);
        let mut settings = VitalsSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["vitals-gateway", "--port", "99999"]).is_err());
    }

    #[test]
    fn settings_flag_selects_file() {
        let cli = Cli::parse_from(["vitals-gateway", "--settings", "/etc/vitals.json"]);
        assert_eq!(cli.settings_path(), PathBuf::from("/etc/vitals.json"));
    }

    #[test]
    fn load_settings_reads_file_then_applies_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7000}, "realtime": {"messageRateLimit": 5}}"#)
            .unwrap();
        let cli = Cli::parse_from([
            "vitals-gateway",
            "--settings",
            path.to_str().unwrap(),
            "--port",
            "7001",
        ]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.realtime.message_rate_limit, 5);
    }

    #[test]
    fn load_settings_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let cli = Cli::parse_from(["vitals-gateway", "--settings", path.to_str().unwrap()]);
        assert!(load_settings(&cli).is_err());
    }
}
