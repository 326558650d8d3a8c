//! Listener and logging settings for the gateway binary.

use serde::{Deserialize, Serialize};

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Bind address for every listener.
    pub host: String,
    /// TCP sync port.
    pub tcp_port: u16,
    /// UDP notification port.
    pub udp_port: u16,
    /// Cross-process notification ingress port (TCP, JSON lines).
    pub notify_port: u16,
    /// HTTP port for `/health` and `/metrics`.
    pub http_port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: 9090,
            udp_port: 9091,
            notify_port: 9092,
            http_port: 9093,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `tracing` filter (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
