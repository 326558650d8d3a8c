//! # mangahub-bridge
//!
//! The unified multi-protocol event bridge.
//!
//! - [`bridge`]: client registry, bounded event queue and dispatcher
//! - [`broadcaster`]: push contracts implemented by protocol adapters
//! - [`client`]: registered connection handles
//! - [`circuit_breaker`]: three-state fault isolation around fallible calls
//! - [`health`]: inactivity-based connection health tracking
//! - [`heartbeat`]: heartbeat liveness with RTT quality classification
//! - [`router`]: filtered in-process pub/sub for typed events
//! - [`metrics`]: injected counters mirrored to the `metrics` facade
//!
//! Producers call [`UnifiedBridge::broadcast_event`], which never blocks.
//! A single dispatcher task drains the queue in FIFO order and fans each
//! event out to the user's direct clients and to every registered
//! protocol broadcaster. Delivery is best-effort: a full queue drops the
//! event and a failing client is logged and skipped.

#![deny(unsafe_code)]

pub mod bridge;
pub mod broadcaster;
pub mod circuit_breaker;
pub mod client;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod router;

pub use bridge::{BridgeConfig, DEFAULT_QUEUE_CAPACITY, UnifiedBridge};
pub use broadcaster::{
    GrpcBroadcaster, ProtocolBroadcaster, RecordedCall, RecordingBroadcaster, UdpBroadcaster,
    WebSocketBroadcaster,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use client::{ClientConn, ProtocolClient, TcpSink};
pub use errors::DeliveryError;
pub use health::{ClientHealth, ConnectionHealthTracker};
pub use heartbeat::{HeartbeatManager, NetworkQuality, classify_rtt};
pub use crate::metrics::{BridgeStats, StatsSnapshot};
pub use registry::{ClientRegistry, ProtocolStats};
pub use router::{EventFilter, EventHandler, EventRouter, HandlerError, RouteReport, handler_fn};
