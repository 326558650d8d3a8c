//! TCP sync adapter.
//!
//! Each connection opens with a JSON handshake line naming the user. The
//! write half is registered with the bridge, which pushes events as JSON
//! lines. Every later line counts as activity; `{"type":"ping"}` is answered
//! with `{"type":"pong"}`. Lines longer than [`MAX_LINE_BYTES`] close the
//! connection. The client is unregistered exactly once when the socket
//! closes, fails or the gateway shuts down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use mangahub_bridge::{ClientConn, ConnectionHealthTracker, TcpSink, UnifiedBridge};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a sync client.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const PONG: &str = "{\"type\":\"pong\"}\n";

type Lines<R> = FramedRead<R, LinesCodec>;

#[derive(Debug, Deserialize)]
struct Handshake {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
}

/// Shared handles for TCP connections.
#[derive(Clone)]
pub struct TcpAdapter {
    bridge: Arc<UnifiedBridge>,
    health: Arc<ConnectionHealthTracker>,
}

impl TcpAdapter {
    /// Create an adapter.
    pub fn new(bridge: Arc<UnifiedBridge>, health: Arc<ConnectionHealthTracker>) -> Self {
        Self { bridge, health }
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
                    let adapter = self.clone();
                    let cancel = cancel.child_token();
                    let _handle = tokio::spawn(async move {
                        if let Err(e) = adapter.handle_connection(stream, cancel).await {
                            warn!(%peer, error = %e, "tcp connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "tcp accept failed"),
            }
        }
        debug!("tcp listener stopped");
    }

    /// Drive one connection to completion.
    pub async fn handle_connection<S>(&self, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next())
            .await
            .context("handshake timed out")?
            .context("connection closed before handshake")?
            .context("unreadable handshake")?;
        let handshake: Handshake =
            serde_json::from_str(&first).context("malformed handshake")?;
        if handshake.user_id.is_empty() {
            bail!("handshake has empty user_id");
        }
        let user_id = handshake.user_id;

        let sink = TcpSink::spawn(write_half);
        let client_id = self
            .bridge
            .register_protocol_client(ClientConn::Tcp(sink.clone()), &user_id);
        self.health.register_client(client_id.as_str());
        info!(%client_id, user_id, "tcp client connected");

        let outcome = self.read_loop(&mut lines, &sink, &client_id, &user_id, &cancel).await;

        self.bridge
            .unregister_protocol_client(client_id.as_str(), &user_id);
        self.health.unregister_client(client_id.as_str());
        info!(%client_id, user_id, dropped = sink.drop_count(), "tcp client disconnected");
        outcome
    }

    async fn read_loop<R>(
        &self,
        lines: &mut Lines<R>,
        sink: &TcpSink,
        client_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                line = lines.next() => line,
            };
            let Some(line) = line else {
                return Ok(());
            };
            let line = line.context("tcp read failed")?;

            self.health.update_activity(client_id);
            let _ = self.bridge.touch_client(client_id, user_id);

            match serde_json::from_str::<ClientMessage>(&line) {
                Ok(msg) if msg.kind == "ping" => {
                    if let Err(e) = sink.send(Arc::from(PONG)) {
                        debug!(client_id, error = %e, "pong not queued");
                    }
                }
                Ok(msg) => debug!(client_id, kind = %msg.kind, "ignoring tcp message"),
                Err(e) => debug!(client_id, error = %e, "ignoring malformed tcp line"),
            }
        }
    }
}
