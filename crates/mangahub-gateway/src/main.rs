//! # mangahub-gateway
//!
//! MangaHub gateway binary: loads settings, starts the unified bridge and
//! serves the TCP sync, UDP notification, notification ingress and HTTP
//! listeners until interrupted.

#![deny(unsafe_code)]

mod http;
mod metrics;
mod notify;
mod server;
mod shutdown;
mod tcp;
mod udp;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mangahub_core::logging::{init_json_subscriber, init_subscriber};
use mangahub_settings::{MangahubSettings, RejectedOverride, load_settings_with_report};
use tracing::{info, warn};

use crate::server::Gateway;
use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};

/// MangaHub gateway.
#[derive(Parser, Debug)]
#[command(name = "mangahub-gateway", about = "MangaHub multi-protocol event gateway")]
struct Cli {
    /// Path to the JSON settings file (missing file means defaults).
    #[arg(long, default_value = "mangahub.json")]
    settings: PathBuf,

    /// Host to bind every listener on.
    #[arg(long)]
    host: Option<String>,

    /// TCP sync port (0 for auto-assign).
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP notification port.
    #[arg(long)]
    udp_port: Option<u16>,

    /// Notification ingress port.
    #[arg(long)]
    notify_port: Option<u16>,

    /// HTTP port for `/health` and `/metrics`.
    #[arg(long)]
    http_port: Option<u16>,

    /// Log filter, e.g. `debug` or `mangahub_bridge=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut MangahubSettings) {
        if let Some(host) = &self.host {
            settings.gateway.host.clone_from(host);
        }
        if let Some(port) = self.tcp_port {
            settings.gateway.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            settings.gateway.udp_port = port;
        }
        if let Some(port) = self.notify_port {
            settings.gateway.notify_port = port;
        }
        if let Some(port) = self.http_port {
            settings.gateway.http_port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

/// Log env overrides the loader ignored. Returns how many were reported.
fn report_rejected_overrides(rejected: &[RejectedOverride]) -> usize {
    for r in rejected {
        warn!(key = %r.key, value = %r.value, kind = r.kind, "ignored invalid env override");
    }
    rejected.len()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let (mut settings, rejected) = load_settings_with_report(&args.settings)
        .with_context(|| format!("Failed to load settings from {}", args.settings.display()))?;
    args.apply(&mut settings);

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }
    // Loader warnings fire before any subscriber exists.
    let _ = report_rejected_overrides(&rejected);

    let prometheus = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    let mut gateway = Gateway::bind(&settings).await?;
    let shutdown = ShutdownCoordinator::new();
    gateway.start(&shutdown, prometheus);
    info!(
        tcp = %gateway.tcp_addr(),
        udp = %gateway.udp_addr(),
        notify = %gateway.notify_addr(),
        http = %gateway.http_addr(),
        active_users = gateway.bridge().get_active_user_count(),
        "gateway started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!(tasks = shutdown.task_count(), "shutdown requested");

    gateway.shutdown(&shutdown, DEFAULT_SHUTDOWN_TIMEOUT).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_settings_untouched() {
        let cli = Cli::parse_from(["mangahub-gateway"]);
        assert_eq!(cli.settings, PathBuf::from("mangahub.json"));
        let mut settings = MangahubSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.gateway.tcp_port, 9090);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "mangahub-gateway",
            "--host",
            "127.0.0.1",
            "--tcp-port",
            "7000",
            "--udp-port",
            "7001",
            "--notify-port",
            "7002",
            "--http-port",
            "0",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut settings = MangahubSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.gateway.host, "127.0.0.1");
        assert_eq!(settings.gateway.tcp_port, 7000);
        assert_eq!(settings.gateway.udp_port, 7001);
        assert_eq!(settings.gateway.notify_port, 7002);
        assert_eq!(settings.gateway.http_port, 0);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn settings_file_is_loaded_before_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mangahub.json");
        std::fs::write(&path, r#"{"gateway":{"tcp_port":8100,"udp_port":8101}}"#).unwrap();

        let cli = Cli::parse_from([
            "mangahub-gateway",
            "--settings",
            path.to_str().unwrap(),
            "--udp-port",
            "8200",
        ]);
        let (mut settings, _) = load_settings_with_report(&cli.settings).unwrap();
        cli.apply(&mut settings);
        assert_eq!(settings.gateway.tcp_port, 8100);
        assert_eq!(settings.gateway.udp_port, 8200);
    }

    #[test]
    fn rejected_overrides_are_reported_after_logging_starts() {
        let mut settings = MangahubSettings::default();
        let rejected = mangahub_settings::apply_overrides_with(&mut settings, |name| {
            (name == "MANGAHUB_UDP_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(settings.gateway.udp_port, 9091);

        assert_eq!(report_rejected_overrides(&rejected), 1);
        assert_eq!(rejected[0].key, "MANGAHUB_UDP_PORT");
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
