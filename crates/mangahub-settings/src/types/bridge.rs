//! Bridge, liveness tracker and circuit breaker settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Event bridge settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Capacity of the event queue. Events beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
        }
    }
}

/// Connection health tracker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Sweep interval in milliseconds.
    pub check_interval_ms: u64,
    /// Inactivity in milliseconds before a sweep counts as missed.
    pub timeout_ms: u64,
    /// Consecutive missed sweeps before a client is unhealthy.
    pub max_missed_checks: u32,
}

impl HealthSettings {
    /// Sweep interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Inactivity timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            timeout_ms: 60_000,
            max_missed_checks: 3,
        }
    }
}

/// Heartbeat/RTT manager settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Sweep interval in milliseconds.
    pub interval_ms: u64,
    /// Milliseconds without a heartbeat before a client is dead.
    pub timeout_ms: u64,
}

impl HeartbeatSettings {
    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Liveness timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 30_000,
        }
    }
}

/// Circuit breaker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Failures before the circuit opens.
    pub threshold: u32,
    /// Milliseconds the circuit stays open before probing.
    pub timeout_ms: u64,
}

impl CircuitBreakerSettings {
    /// Open → half-open delay.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 30_000,
        }
    }
}
