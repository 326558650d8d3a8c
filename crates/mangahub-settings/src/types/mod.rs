//! Settings type definitions.
//!
//! Field names are snake_case in JSON. Every section implements [`Default`]
//! with production values and is marked `#[serde(default)]`, so a settings
//! file only needs the keys it overrides.

mod bridge;
mod gateway;

pub use bridge::*;
pub use gateway::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "bridge": { "queue_capacity": 2000 },
///   "gateway": { "tcp_port": 7000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MangahubSettings {
    /// Event bridge settings.
    pub bridge: BridgeSettings,
    /// Connection health tracker settings.
    pub health: HealthSettings,
    /// Heartbeat/RTT manager settings.
    pub heartbeat: HeartbeatSettings,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Network listener settings.
    pub gateway: GatewaySettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl MangahubSettings {
    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> crate::Result<()> {
        if self.bridge.queue_capacity == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "bridge.queue_capacity must be greater than zero".into(),
            ));
        }
        if self.health.check_interval_ms == 0 || self.heartbeat.interval_ms == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "sweep intervals must be greater than zero".into(),
            ));
        }
        if self.circuit_breaker.threshold == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "circuit_breaker.threshold must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
