//! Push contracts implemented by protocol adapters.
//!
//! The bridge never owns a broadcaster's connections. It holds at most one
//! instance per protocol and calls it from the dispatcher's per-delivery
//! tasks, so implementations must return promptly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mangahub_core::{EventId, ProtocolType, UnifiedEvent};
use parking_lot::Mutex;

use crate::errors::DeliveryError;

/// RPC stream manager.
#[async_trait]
pub trait GrpcBroadcaster: Send + Sync {
    /// Push an event to every stream of a user.
    async fn broadcast_to_user(&self, user_id: &str, event: &UnifiedEvent);

    /// Push an event to one stream.
    async fn send_to_stream(&self, stream_id: &str, event: &UnifiedEvent)
    -> Result<(), DeliveryError>;

    /// Stream IDs open for a user.
    fn active_streams(&self, user_id: &str) -> Vec<String>;
}

/// WebSocket connection manager.
#[async_trait]
pub trait WebSocketBroadcaster: Send + Sync {
    /// Push an event to one connection.
    async fn send_to_connection(
        &self,
        connection_id: &str,
        event: &UnifiedEvent,
    ) -> Result<(), DeliveryError>;

    /// Push an event to every connection of a user.
    async fn broadcast_to_user(&self, user_id: &str, event: &UnifiedEvent);

    /// Connection IDs open for a user.
    fn active_connections(&self, user_id: &str) -> Vec<String>;

    /// Close one connection.
    async fn close_connection(&self, connection_id: &str) -> Result<(), DeliveryError>;
}

/// Datagram subscriber manager.
#[async_trait]
pub trait UdpBroadcaster: Send + Sync {
    /// Push an event to every subscriber of a user.
    async fn broadcast_unified_event(&self, user_id: &str, event: &UnifiedEvent);

    /// Number of subscribers for a user.
    fn subscriber_count(&self, user_id: &str) -> usize;
}

/// One registered broadcaster, tagged by protocol.
#[derive(Clone)]
pub enum ProtocolBroadcaster {
    /// RPC streams.
    Grpc(Arc<dyn GrpcBroadcaster>),
    /// WebSocket connections.
    WebSocket(Arc<dyn WebSocketBroadcaster>),
    /// Datagram subscribers.
    Udp(Arc<dyn UdpBroadcaster>),
}

impl ProtocolBroadcaster {
    /// Protocol served.
    pub fn protocol(&self) -> ProtocolType {
        match self {
            Self::Grpc(_) => ProtocolType::Grpc,
            Self::WebSocket(_) => ProtocolType::WebSocket,
            Self::Udp(_) => ProtocolType::Udp,
        }
    }

    /// Push an event to every connection this broadcaster holds for a user.
    pub async fn broadcast_to_user(&self, user_id: &str, event: &UnifiedEvent) {
        match self {
            Self::Grpc(b) => b.broadcast_to_user(user_id, event).await,
            Self::WebSocket(b) => b.broadcast_to_user(user_id, event).await,
            Self::Udp(b) => b.broadcast_unified_event(user_id, event).await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording broadcaster
// ─────────────────────────────────────────────────────────────────────────────

/// One call observed by [`RecordingBroadcaster`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    /// Method name, e.g. `"broadcast_to_user"`.
    pub method: &'static str,
    /// User, connection or stream targeted.
    pub target: String,
    /// Event pushed, if any.
    pub event_id: Option<EventId>,
}

/// In-memory broadcaster that records every call.
///
/// Implements all three contracts. Targets added with
/// [`fail_target`](Self::fail_target) make direct sends fail.
#[derive(Default)]
pub struct RecordingBroadcaster {
    calls: Mutex<Vec<RecordedCall>>,
    targets: Mutex<HashMap<String, Vec<String>>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingBroadcaster {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `target` as open for `user_id`.
    pub fn track(&self, user_id: &str, target: &str) {
        self.targets
            .lock()
            .entry(user_id.to_owned())
            .or_default()
            .push(target.to_owned());
    }

    /// Make direct sends to `target` fail.
    pub fn fail_target(&self, target: &str) {
        self.failing.lock().push(target.to_owned());
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls to `method`.
    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    fn record(&self, method: &'static str, target: &str, event: Option<&UnifiedEvent>) {
        self.calls.lock().push(RecordedCall {
            method,
            target: target.to_owned(),
            event_id: event.map(|e| e.id.clone()),
        });
    }

    fn direct(
        &self,
        method: &'static str,
        protocol: ProtocolType,
        target: &str,
        event: Option<&UnifiedEvent>,
    ) -> Result<(), DeliveryError> {
        self.record(method, target, event);
        if self.failing.lock().iter().any(|t| t == target) {
            return Err(DeliveryError::UnknownTarget {
                protocol,
                target: target.to_owned(),
            });
        }
        Ok(())
    }

    fn open_for(&self, user_id: &str) -> Vec<String> {
        self.targets.lock().get(user_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GrpcBroadcaster for RecordingBroadcaster {
    async fn broadcast_to_user(&self, user_id: &str, event: &UnifiedEvent) {
        self.record("broadcast_to_user", user_id, Some(event));
    }

    async fn send_to_stream(
        &self,
        stream_id: &str,
        event: &UnifiedEvent,
    ) -> Result<(), DeliveryError> {
        self.direct("send_to_stream", ProtocolType::Grpc, stream_id, Some(event))
    }

    fn active_streams(&self, user_id: &str) -> Vec<String> {
        self.open_for(user_id)
    }
}

#[async_trait]
impl WebSocketBroadcaster for RecordingBroadcaster {
    async fn send_to_connection(
        &self,
        connection_id: &str,
        event: &UnifiedEvent,
    ) -> Result<(), DeliveryError> {
        self.direct(
            "send_to_connection",
            ProtocolType::WebSocket,
            connection_id,
            Some(event),
        )
    }

    async fn broadcast_to_user(&self, user_id: &str, event: &UnifiedEvent) {
        self.record("broadcast_to_user", user_id, Some(event));
    }

    fn active_connections(&self, user_id: &str) -> Vec<String> {
        self.open_for(user_id)
    }

    async fn close_connection(&self, connection_id: &str) -> Result<(), DeliveryError> {
        self.direct(
            "close_connection",
            ProtocolType::WebSocket,
            connection_id,
            None,
        )?;
        for list in self.targets.lock().values_mut() {
            list.retain(|t| t != connection_id);
        }
        Ok(())
    }
}

#[async_trait]
impl UdpBroadcaster for RecordingBroadcaster {
    async fn broadcast_unified_event(&self, user_id: &str, event: &UnifiedEvent) {
        self.record("broadcast_unified_event", user_id, Some(event));
    }

    fn subscriber_count(&self, user_id: &str) -> usize {
        self.open_for(user_id).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangahub_core::EventType;
    use serde_json::Map;

    fn event() -> UnifiedEvent {
        UnifiedEvent::new(EventType::LibraryAdd, "u1", ProtocolType::Tcp, Map::new())
    }

    #[tokio::test]
    async fn enum_dispatches_to_matching_contract() {
        let rec = Arc::new(RecordingBroadcaster::new());
        let ev = event();

        let udp = ProtocolBroadcaster::Udp(rec.clone());
        let ws = ProtocolBroadcaster::WebSocket(rec.clone());
        let grpc = ProtocolBroadcaster::Grpc(rec.clone());
        assert_eq!(udp.protocol(), ProtocolType::Udp);
        assert_eq!(ws.protocol(), ProtocolType::WebSocket);
        assert_eq!(grpc.protocol(), ProtocolType::Grpc);

        udp.broadcast_to_user("u1", &ev).await;
        ws.broadcast_to_user("u1", &ev).await;
        grpc.broadcast_to_user("u1", &ev).await;

        assert_eq!(rec.count("broadcast_unified_event"), 1);
        assert_eq!(rec.count("broadcast_to_user"), 2);
        assert!(rec.calls().iter().all(|c| c.event_id.as_ref() == Some(&ev.id)));
    }

    #[tokio::test]
    async fn failing_target_errors() {
        let rec = RecordingBroadcaster::new();
        rec.fail_target("ws-dead");
        let ev = event();

        assert!(rec.send_to_connection("ws-ok", &ev).await.is_ok());
        let err = rec.send_to_connection("ws-dead", &ev).await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownTarget { .. }));
        assert_eq!(rec.count("send_to_connection"), 2);
    }

    #[tokio::test]
    async fn close_connection_untracks() {
        let rec = RecordingBroadcaster::new();
        rec.track("u1", "ws-1");
        rec.track("u1", "ws-2");
        assert_eq!(rec.active_connections("u1").len(), 2);
        assert_eq!(UdpBroadcaster::subscriber_count(&rec, "u1"), 2);

        rec.close_connection("ws-1").await.unwrap();
        assert_eq!(rec.active_connections("u1"), vec!["ws-2".to_owned()]);
        assert!(rec.active_streams("nobody").is_empty());
    }
}
