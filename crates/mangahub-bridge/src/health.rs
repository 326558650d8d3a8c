//! Inactivity-based connection health.
//!
//! Each sweep counts a miss for every client silent for longer than the
//! timeout. A client turns unhealthy only after `max_missed_checks`
//! consecutive misses; any activity clears the count.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::metrics::HEALTH_UNHEALTHY_TOTAL;

/// Default sweep interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default inactivity timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default consecutive misses before a client is unhealthy.
pub const DEFAULT_MAX_MISSED_CHECKS: u32 = 3;

/// Health record of one client.
#[derive(Clone, Debug)]
pub struct ClientHealth {
    /// Last observed activity.
    pub last_seen: Instant,
    /// Consecutive sweeps that found the client silent.
    pub missed_checks: u32,
    /// Whether the client is considered healthy.
    pub is_healthy: bool,
}

impl ClientHealth {
    fn fresh() -> Self {
        Self {
            last_seen: Instant::now(),
            missed_checks: 0,
            is_healthy: true,
        }
    }
}

/// Tracks activity of registered connections.
pub struct ConnectionHealthTracker {
    clients: RwLock<HashMap<String, ClientHealth>>,
    check_interval: Duration,
    timeout: Duration,
    max_missed_checks: u32,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthTracker {
    /// Create a stopped tracker.
    pub fn new(check_interval: Duration, timeout: Duration, max_missed_checks: u32) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            check_interval,
            timeout,
            max_missed_checks: max_missed_checks.max(1),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Create a stopped tracker with the default intervals.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT, DEFAULT_MAX_MISSED_CHECKS)
    }

    /// Start tracking a client as healthy. Re-registering resets its record.
    pub fn register_client(&self, client_id: &str) {
        let _ = self
            .clients
            .write()
            .insert(client_id.to_owned(), ClientHealth::fresh());
    }

    /// Stop tracking a client.
    pub fn unregister_client(&self, client_id: &str) {
        let _ = self.clients.write().remove(client_id);
    }

    /// Record activity. Ignored for unknown clients.
    pub fn update_activity(&self, client_id: &str) {
        if let Some(health) = self.clients.write().get_mut(client_id) {
            health.last_seen = Instant::now();
            health.missed_checks = 0;
            health.is_healthy = true;
        }
    }

    /// Run one sweep and return the clients that turned unhealthy in it.
    pub fn check_health(&self) -> Vec<String> {
        let mut newly_unhealthy = Vec::new();
        let mut clients = self.clients.write();
        for (id, health) in clients.iter_mut() {
            if health.last_seen.elapsed() <= self.timeout {
                continue;
            }
            health.missed_checks += 1;
            if health.is_healthy && health.missed_checks >= self.max_missed_checks {
                health.is_healthy = false;
                newly_unhealthy.push(id.clone());
            }
        }
        drop(clients);

        for id in &newly_unhealthy {
            warn!(client_id = %id, "client marked unhealthy");
            counter!(HEALTH_UNHEALTHY_TOTAL).increment(1);
        }
        newly_unhealthy
    }

    /// Whether a client is tracked and healthy.
    pub fn is_healthy(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .get(client_id)
            .is_some_and(|h| h.is_healthy)
    }

    /// Copy of a client's record.
    pub fn get_health(&self, client_id: &str) -> Option<ClientHealth> {
        self.clients.read().get(client_id).cloned()
    }

    /// IDs of every unhealthy client.
    pub fn unhealthy_clients(&self) -> Vec<String> {
        self.clients
            .read()
            .iter()
            .filter(|(_, h)| !h.is_healthy)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Tracked clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Spawn the periodic sweep. Returns `false` if already started or stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }
        *sweeper = Some(tokio::spawn(
            sweep_loop(Arc::downgrade(self), self.check_interval, self.cancel.clone())
                .instrument(info_span!("health_sweeper")),
        ));
        true
    }

    /// Stop the sweep. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.sweeper.lock().take();
    }
}

async fn sweep_loop(
    tracker: Weak<ConnectionHealthTracker>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(tracker) = tracker.upgrade() else { break };
                let unhealthy = tracker.check_health();
                debug!(newly_unhealthy = unhealthy.len(), "health sweep complete");
            }
        }
    }
}
