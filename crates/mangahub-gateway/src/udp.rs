//! UDP notification adapter.
//!
//! Subscribers announce themselves with JSON datagrams:
//!
//! - `{"type":"register","user_id":"..."}`
//! - `{"type":"unregister","user_id":"..."}`
//! - `{"type":"heartbeat","user_id":"...","rtt_ms":42}`
//!
//! Each subscription is also registered with the bridge as a UDP client.
//! Every send waits for socket readiness for at most [`UDP_SEND_TIMEOUT`]
//! and goes through a circuit breaker, so only sends that fail or stall
//! count against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mangahub_bridge::{
    CircuitBreaker, CircuitBreakerError, ClientConn, HeartbeatManager, UdpBroadcaster,
    UnifiedBridge,
};
use mangahub_core::{ClientId, UnifiedEvent};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest datagram accepted from subscribers.
const MAX_DATAGRAM: usize = 2048;

/// Longest a single datagram send may wait for the socket.
pub const UDP_SEND_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UdpMessage {
    Register {
        user_id: String,
    },
    Unregister {
        user_id: String,
    },
    Heartbeat {
        user_id: String,
        #[serde(default)]
        rtt_ms: Option<u64>,
    },
}

fn heartbeat_key(user_id: &str, addr: SocketAddr) -> String {
    format!("{user_id}@{addr}")
}

/// Per-user datagram subscribers.
pub struct UdpNotifier {
    socket: Arc<UdpSocket>,
    subscribers: DashMap<String, HashMap<SocketAddr, ClientId>>,
    heartbeat: Arc<HeartbeatManager>,
    breaker: CircuitBreaker,
    bridge: Weak<UnifiedBridge>,
}

impl UdpNotifier {
    /// Create a notifier sending from `socket`.
    pub fn new(
        socket: Arc<UdpSocket>,
        bridge: &Arc<UnifiedBridge>,
        heartbeat: Arc<HeartbeatManager>,
        breaker: CircuitBreaker,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            subscribers: DashMap::new(),
            heartbeat,
            breaker,
            bridge: Arc::downgrade(bridge),
        })
    }

    /// Add a subscriber. Re-registering refreshes its heartbeat.
    pub fn subscribe(&self, user_id: &str, addr: SocketAddr) {
        self.heartbeat.register_client(&heartbeat_key(user_id, addr));
        let mut entry = self.subscribers.entry(user_id.to_owned()).or_default();
        if entry.contains_key(&addr) {
            return;
        }
        if let Some(bridge) = self.bridge.upgrade() {
            let client_id = bridge.register_protocol_client(ClientConn::Udp(addr), user_id);
            let _ = entry.insert(addr, client_id);
            info!(user_id, %addr, "udp subscriber registered");
        }
    }

    /// Remove a subscriber. Unknown subscribers are ignored.
    pub fn unsubscribe(&self, user_id: &str, addr: SocketAddr) {
        self.heartbeat.unregister_client(&heartbeat_key(user_id, addr));
        let removed = {
            let Some(mut entry) = self.subscribers.get_mut(user_id) else {
                return;
            };
            entry.remove(&addr)
        };
        let _ = self.subscribers.remove_if(user_id, |_, subs| subs.is_empty());
        if let Some(client_id) = removed {
            if let Some(bridge) = self.bridge.upgrade() {
                bridge.unregister_protocol_client(client_id.as_str(), user_id);
            }
            info!(user_id, %addr, "udp subscriber removed");
        }
    }

    /// Apply one datagram from `from`.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match serde_json::from_slice::<UdpMessage>(bytes) {
            Ok(UdpMessage::Register { user_id }) if !user_id.is_empty() => {
                self.subscribe(&user_id, from);
            }
            Ok(UdpMessage::Unregister { user_id }) => self.unsubscribe(&user_id, from),
            Ok(UdpMessage::Heartbeat { user_id, rtt_ms }) => {
                let key = heartbeat_key(&user_id, from);
                match rtt_ms {
                    Some(ms) => self.heartbeat.record_heartbeat(&key, Duration::from_millis(ms)),
                    None => {
                        let _ = self.heartbeat.touch(&key);
                    }
                }
                let client_id = self
                    .subscribers
                    .get(&user_id)
                    .and_then(|subs| subs.get(&from).cloned());
                if let (Some(client_id), Some(bridge)) = (client_id, self.bridge.upgrade()) {
                    let _ = bridge.touch_client(client_id.as_str(), &user_id);
                }
            }
            Ok(UdpMessage::Register { .. }) => debug!(%from, "ignoring register with empty user_id"),
            Err(e) => debug!(%from, error = %e, "ignoring malformed datagram"),
        }
    }

    /// Receive datagrams until cancelled.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(e) => warn!(error = %e, "udp receive failed"),
            }
        }
        debug!("udp listener stopped");
    }

    fn prune_dead(&self, user_id: &str) {
        let dead: Vec<SocketAddr> = self
            .subscribers
            .get(user_id)
            .map(|subs| {
                subs.keys()
                    .filter(|addr| !self.heartbeat.is_alive(&heartbeat_key(user_id, **addr)))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for addr in dead {
            debug!(user_id, %addr, "pruning silent udp subscriber");
            self.unsubscribe(user_id, addr);
        }
    }

    fn targets(&self, user_id: &str) -> Vec<(String, SocketAddr)> {
        if user_id.is_empty() {
            let users: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
            for user in &users {
                self.prune_dead(user);
            }
            self.subscribers
                .iter()
                .flat_map(|e| {
                    let user = e.key().clone();
                    e.value().keys().map(move |a| (user.clone(), *a)).collect::<Vec<_>>()
                })
                .collect()
        } else {
            self.prune_dead(user_id);
            self.subscribers
                .get(user_id)
                .map(|subs| subs.keys().map(|a| (user_id.to_owned(), *a)).collect())
                .unwrap_or_default()
        }
    }
}

#[async_trait]
impl UdpBroadcaster for UdpNotifier {
    async fn broadcast_unified_event(&self, user_id: &str, event: &UnifiedEvent) {
        let targets = self.targets(user_id);
        if targets.is_empty() {
            return;
        }
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to serialize event");
                return;
            }
        };
        for (user, addr) in targets {
            let sent = self
                .breaker
                .call_async(|| async {
                    tokio::time::timeout(UDP_SEND_TIMEOUT, self.socket.send_to(&payload, addr))
                        .await
                        .unwrap_or_else(|_| {
                            Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "udp send timed out",
                            ))
                        })
                })
                .await;
            match sent {
                Ok(_) => {}
                Err(CircuitBreakerError::Open) => {
                    debug!(event_id = %event.id, "udp circuit open, skipping remaining sends");
                    return;
                }
                Err(CircuitBreakerError::Operation(e)) => {
                    warn!(user_id = %user, %addr, error = %e, "udp send failed");
                }
            }
        }
    }

    fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers.get(user_id).map_or(0, |subs| subs.len())
    }
}
