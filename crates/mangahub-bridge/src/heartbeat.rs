//! Heartbeat liveness and round-trip-time quality.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::metrics::HEARTBEAT_EXPIRED_TOTAL;

/// Default sweep interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Default heartbeat timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// RTT quality band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// Under 50ms.
    Excellent,
    /// Under 100ms.
    Good,
    /// Under 200ms.
    Fair,
    /// Under 500ms.
    Poor,
    /// 500ms or more.
    VeryPoor,
    /// No RTT recorded.
    Unknown,
}

impl NetworkQuality {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::VeryPoor => "very_poor",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a round-trip time.
pub fn classify_rtt(rtt: Option<Duration>) -> NetworkQuality {
    let Some(rtt) = rtt else {
        return NetworkQuality::Unknown;
    };
    match rtt.as_millis() {
        0..50 => NetworkQuality::Excellent,
        50..100 => NetworkQuality::Good,
        100..200 => NetworkQuality::Fair,
        200..500 => NetworkQuality::Poor,
        _ => NetworkQuality::VeryPoor,
    }
}

#[derive(Clone, Copy, Debug)]
struct HeartbeatRecord {
    last_heartbeat: Instant,
    rtt: Option<Duration>,
}

/// Tracks heartbeats and RTT per client.
pub struct HeartbeatManager {
    clients: RwLock<HashMap<String, HeartbeatRecord>>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatManager {
    /// Create a stopped manager.
    pub fn new(interval: Duration, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            interval,
            timeout,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Create a stopped manager with the default interval and timeout.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_INTERVAL, DEFAULT_TIMEOUT)
    }

    /// Start tracking a client with no RTT yet.
    pub fn register_client(&self, client_id: &str) {
        let _ = self.clients.write().insert(
            client_id.to_owned(),
            HeartbeatRecord {
                last_heartbeat: Instant::now(),
                rtt: None,
            },
        );
    }

    /// Stop tracking a client.
    pub fn unregister_client(&self, client_id: &str) {
        let _ = self.clients.write().remove(client_id);
    }

    /// Record a heartbeat with its measured RTT. Tracks the client if new.
    pub fn record_heartbeat(&self, client_id: &str, rtt: Duration) {
        let _ = self.clients.write().insert(
            client_id.to_owned(),
            HeartbeatRecord {
                last_heartbeat: Instant::now(),
                rtt: Some(rtt),
            },
        );
    }

    /// Refresh the heartbeat time, keeping the last RTT. Returns `false` for
    /// unknown clients.
    pub fn touch(&self, client_id: &str) -> bool {
        match self.clients.write().get_mut(client_id) {
            Some(record) => {
                record.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Whether the last heartbeat is within the timeout.
    pub fn is_alive(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .get(client_id)
            .is_some_and(|r| r.last_heartbeat.elapsed() < self.timeout)
    }

    /// Last recorded RTT.
    pub fn get_rtt(&self, client_id: &str) -> Option<Duration> {
        self.clients.read().get(client_id).and_then(|r| r.rtt)
    }

    /// Quality band of the last recorded RTT.
    pub fn get_network_quality(&self, client_id: &str) -> NetworkQuality {
        classify_rtt(self.get_rtt(client_id))
    }

    /// Tracked clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Drop every client whose last heartbeat exceeds the timeout.
    pub fn sweep_expired(&self) -> Vec<String> {
        let mut expired = Vec::new();
        self.clients.write().retain(|id, record| {
            let alive = record.last_heartbeat.elapsed() <= self.timeout;
            if !alive {
                expired.push(id.clone());
            }
            alive
        });
        for id in &expired {
            warn!(client_id = %id, timeout_ms = self.timeout.as_millis(), "heartbeat expired");
            counter!(HEARTBEAT_EXPIRED_TOTAL).increment(1);
        }
        expired
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
            sweep_loop(Arc::downgrade(self), self.interval, self.cancel.clone())
                .instrument(info_span!("heartbeat_sweeper")),
        ));
        true
    }

    /// Stop the sweep. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.sweeper.lock().take();
    }
}

async fn sweep_loop(manager: Weak<HeartbeatManager>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                let _ = manager.sweep_expired();
            }
        }
    }
}
