//! Registered connection handles.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mangahub_core::{ClientId, ProtocolType};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::errors::DeliveryError;

/// Lines buffered per TCP connection before new ones are dropped.
pub const TCP_SEND_QUEUE: usize = 256;

/// Longest a single line write may stall before the writer gives up.
pub const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send side of a TCP connection's outbound line queue.
///
/// A writer task owns the socket and drains the queue. Pushes never wait:
/// a full queue drops the line and counts it, a closed queue means the
/// writer has exited.
#[derive(Clone)]
pub struct TcpSink {
    tx: mpsc::Sender<Arc<str>>,
    dropped: Arc<AtomicU64>,
}

impl TcpSink {
    /// Create a sink and the receiver a writer task should drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Create a sink whose writer task writes to `writer`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, rx) = Self::channel(TCP_SEND_QUEUE);
        let _handle = tokio::spawn(async move {
            if let Err(e) = run_tcp_writer(writer, rx, TCP_WRITE_TIMEOUT).await {
                debug!(error = %e, "tcp writer stopped");
            }
        });
        sink
    }

    /// Queue one line without waiting.
    pub fn send(&self, line: Arc<str>) -> Result<(), DeliveryError> {
        match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Lines dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the writer has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain `rx` into `writer` until every sender is gone, a write fails or a
/// write stalls for longer than `write_timeout`.
pub async fn run_tcp_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "tcp write stalled",
                ));
            }
        }
    }
    Ok(())
}

/// Per-protocol connection handle.
///
/// The bridge only looks inside when it dispatches: TCP lines are queued on
/// the connection's sink, the other variants name a target owned by a
/// broadcaster.
#[derive(Clone)]
pub enum ClientConn {
    /// Outbound queue of a TCP stream, shared with the adapter.
    Tcp(TcpSink),
    /// Remote address of a UDP subscriber.
    Udp(SocketAddr),
    /// Connection ID owned by the WebSocket broadcaster.
    WebSocket {
        /// Connection ID.
        connection_id: String,
    },
    /// Stream ID owned by the gRPC broadcaster.
    Grpc {
        /// Stream ID.
        stream_id: String,
    },
}

impl ClientConn {
    /// Spawn a writer task for a stream and wrap its sink.
    pub fn tcp<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Tcp(TcpSink::spawn(writer))
    }

    /// Name a WebSocket connection.
    pub fn websocket(connection_id: impl Into<String>) -> Self {
        Self::WebSocket {
            connection_id: connection_id.into(),
        }
    }

    /// Name a gRPC stream.
    pub fn grpc(stream_id: impl Into<String>) -> Self {
        Self::Grpc {
            stream_id: stream_id.into(),
        }
    }

    /// Protocol tag of this handle.
    pub fn protocol(&self) -> ProtocolType {
        match self {
            Self::Tcp(_) => ProtocolType::Tcp,
            Self::Udp(_) => ProtocolType::Udp,
            Self::WebSocket { .. } => ProtocolType::WebSocket,
            Self::Grpc { .. } => ProtocolType::Grpc,
        }
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(_) => f.write_str("Tcp(..)"),
            Self::Udp(addr) => f.debug_tuple("Udp").field(addr).finish(),
            Self::WebSocket { connection_id } => f
                .debug_struct("WebSocket")
                .field("connection_id", connection_id)
                .finish(),
            Self::Grpc { stream_id } => {
                f.debug_struct("Grpc").field("stream_id", stream_id).finish()
            }
        }
    }
}

/// A live connection registered with the bridge.
///
/// Clones share the activity clock.
#[derive(Clone, Debug)]
pub struct ProtocolClient {
    /// Derived client ID.
    pub id: ClientId,
    /// Protocol tag.
    pub protocol: ProtocolType,
    /// Connection handle.
    pub conn: ClientConn,
    /// Owning user.
    pub user_id: String,
    /// Registration time.
    pub connected_at: DateTime<Utc>,
    last_activity_ms: Arc<AtomicI64>,
}

impl ProtocolClient {
    pub(crate) fn new(
        id: ClientId,
        conn: ClientConn,
        user_id: String,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            protocol: conn.protocol(),
            conn,
            user_id,
            connected_at,
            last_activity_ms: Arc::new(AtomicI64::new(connected_at.timestamp_millis())),
        }
    }

    /// Time of the last observed activity.
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}
