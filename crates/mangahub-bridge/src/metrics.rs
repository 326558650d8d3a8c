//! Bridge counters.
//!
//! [`BridgeStats`] is injected into each [`UnifiedBridge`](crate::UnifiedBridge)
//! so that independent instances (one per test, say) never share state.
//! Every increment is mirrored to the `metrics` facade, which is a no-op
//! until the binary installs a recorder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use mangahub_core::ProtocolType;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;

// Metric name constants to avoid typos across crates.

/// Events accepted onto the bridge queue (counter).
pub const BRIDGE_EVENTS_ENQUEUED_TOTAL: &str = "bridge_events_enqueued_total";
/// Events pulled off the queue and routed (counter).
pub const BRIDGE_EVENTS_ROUTED_TOTAL: &str = "bridge_events_routed_total";
/// Successful pushes to a client or broadcaster (counter, labels: protocol).
pub const BRIDGE_DELIVERIES_TOTAL: &str = "bridge_deliveries_total";
/// Failed pushes to a client or broadcaster (counter, labels: protocol).
pub const BRIDGE_DELIVERY_FAILURES_TOTAL: &str = "bridge_delivery_failures_total";
/// Client registrations (counter, labels: protocol).
pub const BRIDGE_REGISTRATIONS_TOTAL: &str = "bridge_registrations_total";
/// Circuit breaker rejections while open (counter, labels: breaker).
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "circuit_rejections_total";
/// Clients purged by the heartbeat sweep (counter).
pub const HEARTBEAT_EXPIRED_TOTAL: &str = "heartbeat_expired_total";
/// Clients newly marked unhealthy by the health sweep (counter).
pub const HEALTH_UNHEALTHY_TOTAL: &str = "health_unhealthy_total";

/// Counters for one bridge instance.
#[derive(Debug, Default)]
pub struct BridgeStats {
    events_enqueued: AtomicU64,
    events_routed: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    registrations: Mutex<BTreeMap<ProtocolType, u64>>,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events accepted onto the queue.
    pub events_enqueued: u64,
    /// Events routed by the dispatcher.
    pub events_routed: u64,
    /// Successful pushes.
    pub deliveries: u64,
    /// Failed pushes.
    pub delivery_failures: u64,
    /// Lifetime registrations per protocol.
    pub registrations: BTreeMap<ProtocolType, u64>,
}

impl BridgeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        let _ = self.events_enqueued.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_EVENTS_ENQUEUED_TOTAL).increment(1);
    }

    pub(crate) fn record_routed(&self) {
        let _ = self.events_routed.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_EVENTS_ROUTED_TOTAL).increment(1);
    }

    pub(crate) fn record_delivery(&self, protocol: ProtocolType) {
        let _ = self.deliveries.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_DELIVERIES_TOTAL, "protocol" => protocol.as_str()).increment(1);
    }

    pub(crate) fn record_delivery_failure(&self, protocol: ProtocolType) {
        let _ = self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_DELIVERY_FAILURES_TOTAL, "protocol" => protocol.as_str()).increment(1);
    }

    pub(crate) fn record_registration(&self, protocol: ProtocolType) {
        *self.registrations.lock().entry(protocol).or_insert(0) += 1;
        counter!(BRIDGE_REGISTRATIONS_TOTAL, "protocol" => protocol.as_str()).increment(1);
    }

    /// Events accepted onto the queue so far.
    pub fn events_enqueued(&self) -> u64 {
        self.events_enqueued.load(Ordering::Relaxed)
    }

    /// Events routed so far.
    pub fn events_routed(&self) -> u64 {
        self.events_routed.load(Ordering::Relaxed)
    }

    /// Failed pushes so far.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_enqueued: self.events_enqueued(),
            events_routed: self.events_routed(),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures(),
            registrations: self.registrations.lock().clone(),
        }
    }
}
