//! The unified bridge: client registry, bounded event queue and dispatcher.
//!
//! ## Delivery model
//!
//! [`UnifiedBridge::broadcast_event`] is a non-blocking enqueue. When the
//! queue is full the event is dropped with a warning; producers never wait
//! on bridge congestion.
//!
//! One dispatcher task drains the queue in FIFO order. For each event it
//! snapshots the target user's clients and the registered broadcasters
//! under the read lock, releases the lock, then spawns one task per
//! delivery. Direct TCP clients get a JSON line queued on their
//! connection's sink, which never waits on a slow peer; WebSocket and gRPC
//! clients are pushed through their broadcaster. Every
//! registered broadcaster is also asked to push to the user, whether or not
//! the registry holds clients for them, so a client tracked in both places
//! receives the event twice.
//!
//! ## Shutdown
//!
//! [`UnifiedBridge::stop`] cancels the dispatcher. An event already pulled
//! off the queue is still routed; anything left in the queue is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use mangahub_core::{ClientId, ProtocolType, UnifiedEvent};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::broadcaster::{
    GrpcBroadcaster, ProtocolBroadcaster, UdpBroadcaster, WebSocketBroadcaster,
};
use crate::client::{ClientConn, ProtocolClient};
use crate::errors::DeliveryError;
use crate::metrics::BridgeStats;
use crate::registry::{ClientRegistry, ProtocolStats};

/// Default event queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bridge construction parameters.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Bounded queue size. Values below 1 are raised to 1.
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Default)]
struct Broadcasters {
    grpc: Option<Arc<dyn GrpcBroadcaster>>,
    websocket: Option<Arc<dyn WebSocketBroadcaster>>,
    udp: Option<Arc<dyn UdpBroadcaster>>,
}

impl Broadcasters {
    fn registered(&self) -> Vec<ProtocolBroadcaster> {
        let mut out = Vec::with_capacity(3);
        if let Some(b) = &self.grpc {
            out.push(ProtocolBroadcaster::Grpc(Arc::clone(b)));
        }
        if let Some(b) = &self.websocket {
            out.push(ProtocolBroadcaster::WebSocket(Arc::clone(b)));
        }
        if let Some(b) = &self.udp {
            out.push(ProtocolBroadcaster::Udp(Arc::clone(b)));
        }
        out
    }
}

#[derive(Default)]
struct BridgeState {
    registry: ClientRegistry,
    broadcasters: Broadcasters,
}

/// Multi-protocol event bridge.
///
/// Shared as `Arc<UnifiedBridge>` between protocol adapters and producers.
pub struct UnifiedBridge {
    state: RwLock<BridgeState>,
    tx: mpsc::Sender<UnifiedEvent>,
    rx: Mutex<Option<mpsc::Receiver<UnifiedEvent>>>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    sequence: AtomicU64,
    stats: Arc<BridgeStats>,
}

impl UnifiedBridge {
    /// Create a stopped bridge.
    pub fn new(config: BridgeConfig, stats: Arc<BridgeStats>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            state: RwLock::new(BridgeState::default()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            sequence: AtomicU64::new(0),
            stats,
        })
    }

    /// Create a stopped bridge with default capacity and fresh counters.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(BridgeConfig::default(), Arc::new(BridgeStats::new()))
    }

    // ── Lifecycle ──

    /// Spawn the dispatcher. Returns `false` if it was already started or
    /// the bridge has been stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };
        let handle = tokio::spawn(
            dispatch_loop(Arc::downgrade(self), rx, self.cancel.clone())
                .instrument(info_span!("bridge_dispatcher")),
        );
        *self.dispatcher.lock() = Some(handle);
        info!("unified bridge started");
        true
    }

    /// Stop the dispatcher and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "bridge dispatcher task failed");
            }
            info!("unified bridge stopped");
        }
    }

    /// Whether the dispatcher is running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.dispatcher.lock().is_some()
    }

    // ── Registry ──

    /// Register a connection for a user and return its client ID.
    pub fn register_protocol_client(&self, conn: ClientConn, user_id: &str) -> ClientId {
        let protocol = conn.protocol();
        let now = Utc::now();
        let id = ClientId::derive(
            user_id,
            protocol,
            now.timestamp_nanos_opt().unwrap_or_default(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        let client = ProtocolClient::new(id.clone(), conn, user_id.to_owned(), now);
        self.state.write().registry.register(client);
        self.stats.record_registration(protocol);
        debug!(client_id = %id, user_id, %protocol, "registered protocol client");
        id
    }

    /// Remove a connection. Unknown IDs are ignored.
    pub fn unregister_protocol_client(&self, client_id: &str, user_id: &str) {
        let removed = self.state.write().registry.unregister(client_id, user_id);
        if let Some(client) = removed {
            debug!(client_id, user_id, protocol = %client.protocol, "unregistered protocol client");
        }
    }

    /// Record activity on a client. Returns `false` if it is not registered.
    pub fn touch_client(&self, client_id: &str, user_id: &str) -> bool {
        let state = self.state.read();
        match state.registry.find(client_id, user_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Users with at least one connection.
    pub fn get_active_user_count(&self) -> usize {
        self.state.read().registry.active_user_count()
    }

    /// Connections across every user.
    pub fn get_total_connection_count(&self) -> usize {
        self.state.read().registry.total_connection_count()
    }

    /// Per-user, per-protocol connection counts.
    pub fn get_protocol_stats(&self) -> ProtocolStats {
        self.state.read().registry.protocol_stats()
    }

    /// Snapshot of one user's connections.
    pub fn get_user_clients(&self, user_id: &str) -> Vec<ProtocolClient> {
        self.state.read().registry.clients_for(user_id)
    }

    // ── Broadcasters ──

    /// Set the gRPC broadcaster, replacing any previous one.
    pub fn set_grpc_broadcaster(&self, broadcaster: Arc<dyn GrpcBroadcaster>) {
        self.state.write().broadcasters.grpc = Some(broadcaster);
    }

    /// Set the WebSocket broadcaster, replacing any previous one.
    pub fn set_websocket_broadcaster(&self, broadcaster: Arc<dyn WebSocketBroadcaster>) {
        self.state.write().broadcasters.websocket = Some(broadcaster);
    }

    /// Set the UDP broadcaster, replacing any previous one.
    pub fn set_udp_broadcaster(&self, broadcaster: Arc<dyn UdpBroadcaster>) {
        self.state.write().broadcasters.udp = Some(broadcaster);
    }

    // ── Events ──

    /// Enqueue an event without blocking. Drops it if the queue is full.
    pub fn broadcast_event(&self, event: UnifiedEvent) {
        match self.tx.try_send(event) {
            Ok(()) => self.stats.record_enqueued(),
            Err(TrySendError::Full(event)) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    user_id = %event.user_id,
                    "event queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event_id = %event.id, "bridge closed, discarding event");
            }
        }
    }

    /// Events waiting in the queue.
    pub fn queued_events(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Counters for this bridge.
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    fn route_event(&self, event: UnifiedEvent) {
        let (clients, broadcasters) = {
            let state = self.state.read();
            let clients = if event.is_global() {
                Vec::new()
            } else {
                state.registry.clients_for(&event.user_id)
            };
            (clients, state.broadcasters.clone())
        };
        self.stats.record_routed();
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = %event.user_id,
            clients = clients.len(),
            "routing event"
        );

        let event = Arc::new(event);

        for client in clients {
            if client.protocol == ProtocolType::Udp {
                continue;
            }
            let event = Arc::clone(&event);
            let stats = Arc::clone(&self.stats);
            let broadcasters = broadcasters.clone();
            let _handle = tokio::spawn(async move {
                match send_direct(&client, &event, &broadcasters).await {
                    Ok(()) => stats.record_delivery(client.protocol),
                    Err(e) => {
                        stats.record_delivery_failure(client.protocol);
                        warn!(
                            client_id = %client.id,
                            user_id = %client.user_id,
                            protocol = %client.protocol,
                            event_id = %event.id,
                            error = %e,
                            "failed to deliver event to client"
                        );
                    }
                }
            });
        }

        for broadcaster in broadcasters.registered() {
            let event = Arc::clone(&event);
            let stats = Arc::clone(&self.stats);
            let _handle = tokio::spawn(async move {
                broadcaster.broadcast_to_user(&event.user_id, &event).await;
                stats.record_delivery(broadcaster.protocol());
            });
        }
    }
}

async fn dispatch_loop(
    bridge: Weak<UnifiedBridge>,
    mut rx: mpsc::Receiver<UnifiedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(bridge) = bridge.upgrade() else { break };
        bridge.route_event(event);
    }
    debug!(discarded = rx.len(), "dispatcher exiting");
}

async fn send_direct(
    client: &ProtocolClient,
    event: &UnifiedEvent,
    broadcasters: &Broadcasters,
) -> Result<(), DeliveryError> {
    match &client.conn {
        ClientConn::Tcp(sink) => sink.send(Arc::from(event.to_json_line()?)),
        ClientConn::WebSocket { connection_id } => match &broadcasters.websocket {
            Some(ws) => ws.send_to_connection(connection_id, event).await,
            None => Err(DeliveryError::NoBroadcaster(ProtocolType::WebSocket)),
        },
        ClientConn::Grpc { stream_id } => match &broadcasters.grpc {
            Some(grpc) => grpc.send_to_stream(stream_id, event).await,
            None => Err(DeliveryError::NoBroadcaster(ProtocolType::Grpc)),
        },
        // Datagram subscribers are reached through the UDP broadcaster pass.
        ClientConn::Udp(_) => Ok(()),
    }
}
