//! Cross-process notification ingress.
//!
//! Sibling processes connect over TCP and write one
//! [`NotificationEnvelope`] per line. Each envelope becomes a local event,
//! passes the router's filters and is handed to the bridge.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mangahub_bridge::{EventHandler, EventRouter, HandlerError, UnifiedBridge};
use mangahub_core::{EventType, NotificationEnvelope, ProtocolType, UnifiedEvent};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest envelope line accepted from a sibling process.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Hands routed events to the bridge queue.
pub struct BridgeForwarder {
    bridge: Arc<UnifiedBridge>,
}

impl BridgeForwarder {
    /// Create a forwarder.
    pub fn new(bridge: Arc<UnifiedBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl EventHandler for BridgeForwarder {
    fn name(&self) -> &str {
        "bridge_forwarder"
    }

    async fn handle(&self, event: &UnifiedEvent) -> Result<(), HandlerError> {
        self.bridge.broadcast_event(event.clone());
        Ok(())
    }
}

/// Router that forwards every event type to the bridge, dropping global
/// events whose type is not meant for everyone.
pub fn forwarding_router(bridge: &Arc<UnifiedBridge>) -> EventRouter {
    let router = EventRouter::new();
    router.add_filter(|event| !event.is_global() || event.event_type.allows_global());
    let forwarder: Arc<dyn EventHandler> = Arc::new(BridgeForwarder::new(Arc::clone(bridge)));
    for event_type in EventType::ALL {
        router.register_handler(event_type, Arc::clone(&forwarder));
    }
    router
}

/// Accepts notification connections.
#[derive(Clone)]
pub struct NotificationIngress {
    router: Arc<EventRouter>,
}

impl NotificationIngress {
    /// Create an ingress over `router`.
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self { router }
    }

    /// Accept connections until cancelled.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let ingress = self.clone();
                    let cancel = cancel.child_token();
                    let _handle = tokio::spawn(async move {
                        match ingress.read_envelopes(stream, cancel).await {
                            Ok(count) => debug!(%peer, count, "notification connection closed"),
                            Err(e) => warn!(%peer, error = %e, "notification connection failed"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "notification accept failed"),
            }
        }
        debug!("notification listener stopped");
    }

    /// Read envelopes until EOF or cancellation. Returns how many were
    /// accepted by the router. A line longer than [`MAX_ENVELOPE_BYTES`]
    /// ends the connection with an error.
    pub async fn read_envelopes<R>(&self, stream: R, cancel: CancellationToken) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_ENVELOPE_BYTES));
        let mut accepted = 0;
        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                line = lines.next() => line,
            };
            let Some(line) = line else { break };
            let line = line.context("notification read failed")?;
            if line.trim().is_empty() {
                continue;
            }

            let event = match NotificationEnvelope::parse(&line)
                .and_then(|env| env.into_event(ProtocolType::Tcp))
            {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "skipping malformed notification");
                    continue;
                }
            };
            if self.router.route(&event).await.accepted {
                accepted += 1;
            }
        }
        Ok(accepted)
    }
}
