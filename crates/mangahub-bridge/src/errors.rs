//! Delivery error types.

use mangahub_core::ProtocolType;
use thiserror::Error;

/// Why a single push to a client or broadcaster failed.
///
/// Delivery errors never escape the bridge: they are logged, counted and
/// the remaining recipients are still served.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Writing to a raw socket failed.
    #[error("socket write failed: {0}")]
    Io(#[from] std::io::Error),
    /// The connection's outbound queue is full; the event was dropped.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection's writer has exited.
    #[error("connection closed")]
    Closed,
    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    /// No broadcaster is registered for the client's protocol.
    #[error("no {0} broadcaster registered")]
    NoBroadcaster(ProtocolType),
    /// The target connection or stream is not known to its broadcaster.
    #[error("unknown {protocol} target: {target}")]
    UnknownTarget {
        /// Protocol of the target.
        protocol: ProtocolType,
        /// Connection or stream ID.
        target: String,
    },
    /// The broadcaster reported a failure.
    #[error("{protocol} broadcaster failed: {message}")]
    Broadcaster {
        /// Protocol of the broadcaster.
        protocol: ProtocolType,
        /// Failure description.
        message: String,
    },
}

impl DeliveryError {
    /// Build a broadcaster failure.
    pub fn broadcaster(protocol: ProtocolType, message: impl Into<String>) -> Self {
        Self::Broadcaster {
            protocol,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            DeliveryError::NoBroadcaster(ProtocolType::Grpc).to_string(),
            "no grpc broadcaster registered"
        );
        assert_eq!(
            DeliveryError::UnknownTarget {
                protocol: ProtocolType::WebSocket,
                target: "ws-1".into(),
            }
            .to_string(),
            "unknown websocket target: ws-1"
        );
        assert_eq!(
            DeliveryError::broadcaster(ProtocolType::Udp, "socket closed").to_string(),
            "udp broadcaster failed: socket closed"
        );
    }

    #[test]
    fn queue_errors_display() {
        assert_eq!(DeliveryError::QueueFull.to_string(), "outbound queue full");
        assert_eq!(DeliveryError::Closed.to_string(), "connection closed");
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: DeliveryError = io.into();
        assert!(matches!(err, DeliveryError::Io(_)));
        assert!(err.to_string().contains("pipe"));
    }
}
