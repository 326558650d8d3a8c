//! Unified domain events delivered to every connected device.
//!
//! A [`UnifiedEvent`] is an immutable fact about a user's state. Producers
//! build one with [`UnifiedEvent::new`] and hand it to the bridge; the bridge
//! never mutates it. The JSON shape is fixed:
//!
//! ```text
//! {"id","type","user_id","source_protocol","timestamp","data",
//!  "metadata":{"priority","ttl","timestamp","source","correlation_id"?}}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::EventId;

/// Default event priority.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Default event time-to-live in seconds.
pub const DEFAULT_TTL_SECS: i64 = 3600;

// ─────────────────────────────────────────────────────────────────────────────
// ProtocolType
// ─────────────────────────────────────────────────────────────────────────────

/// Transport a client is connected through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Persistent socket stream.
    Tcp,
    /// Datagram notifications.
    Udp,
    /// Upgraded socket stream.
    #[serde(rename = "websocket")]
    WebSocket,
    /// RPC stream.
    Grpc,
}

impl ProtocolType {
    /// Every supported protocol, in a stable order.
    pub const ALL: [ProtocolType; 4] = [Self::Tcp, Self::Udp, Self::WebSocket, Self::Grpc];

    /// Wire name of the protocol.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::WebSocket => "websocket",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol or event type name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for ProtocolType {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "protocol",
                value: s.to_owned(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventType
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of event kinds the bridge carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Reading progress changed.
    ProgressUpdate,
    /// Manga added to the library.
    LibraryAdd,
    /// Manga removed from the library.
    LibraryRemove,
    /// Library entry edited.
    LibraryUpdate,
    /// A chapter was finished.
    ChapterCompleted,
    /// First chapter of a manga opened.
    MangaStarted,
    /// Reading status changed.
    StatusChange,
    /// A device asked for a full sync.
    SyncRequest,
    /// A sync finished.
    SyncComplete,
    /// Conflicting edits were detected between devices.
    ConflictDetected,
    /// A device came online.
    DeviceConnected,
    /// A device went away.
    DeviceDisconnected,
    /// The user's session expired.
    SessionExpired,
    /// Liveness check.
    HealthCheck,
    /// Server metrics snapshot.
    MetricsUpdate,
    /// A new chapter was released.
    ChapterRelease,
    /// Free-form message addressed to the user.
    UserMessage,
}

impl EventType {
    /// Every event type.
    pub const ALL: [EventType; 17] = [
        Self::ProgressUpdate,
        Self::LibraryAdd,
        Self::LibraryRemove,
        Self::LibraryUpdate,
        Self::ChapterCompleted,
        Self::MangaStarted,
        Self::StatusChange,
        Self::SyncRequest,
        Self::SyncComplete,
        Self::ConflictDetected,
        Self::DeviceConnected,
        Self::DeviceDisconnected,
        Self::SessionExpired,
        Self::HealthCheck,
        Self::MetricsUpdate,
        Self::ChapterRelease,
        Self::UserMessage,
    ];

    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProgressUpdate => "progress_update",
            Self::LibraryAdd => "library_add",
            Self::LibraryRemove => "library_remove",
            Self::LibraryUpdate => "library_update",
            Self::ChapterCompleted => "chapter_completed",
            Self::MangaStarted => "manga_started",
            Self::StatusChange => "status_change",
            Self::SyncRequest => "sync_request",
            Self::SyncComplete => "sync_complete",
            Self::ConflictDetected => "conflict_detected",
            Self::DeviceConnected => "device_connected",
            Self::DeviceDisconnected => "device_disconnected",
            Self::SessionExpired => "session_expired",
            Self::HealthCheck => "health_check",
            Self::MetricsUpdate => "metrics_update",
            Self::ChapterRelease => "chapter_release",
            Self::UserMessage => "user_message",
        }
    }

    /// Whether an event of this type may be addressed to every user at once.
    ///
    /// Library and progress changes only make sense for one user; releases,
    /// health checks and announcements can be global.
    #[must_use]
    pub fn allows_global(self) -> bool {
        matches!(
            self,
            Self::ChapterRelease | Self::HealthCheck | Self::MetricsUpdate | Self::UserMessage
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "event type",
                value: s.to_owned(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UnifiedEvent
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery hints carried with every event.
///
/// `priority` and `ttl` are populated but not acted on by the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Relative priority (higher is more urgent).
    pub priority: i32,
    /// Time-to-live in seconds.
    pub ttl: i64,
    /// When the metadata was attached.
    pub timestamp: DateTime<Utc>,
    /// Name of the producing component.
    pub source: String,
    /// Optional ID tying related events together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Peers that marshal a missing payload as `null` still get an empty map.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Something that happened to a user's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    /// Unique, never reused.
    pub id: EventId,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Target user. Empty means global.
    pub user_id: String,
    /// Protocol that produced the event. Informational only.
    pub source_protocol: ProtocolType,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload. `null` decodes as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    /// Delivery hints.
    pub metadata: EventMetadata,
}

impl UnifiedEvent {
    /// Build an event with a fresh ID, the current time and default metadata.
    pub fn new(
        event_type: EventType,
        user_id: impl Into<String>,
        source_protocol: ProtocolType,
        data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            event_type,
            user_id: user_id.into(),
            source_protocol,
            timestamp: now,
            data,
            metadata: EventMetadata {
                priority: DEFAULT_PRIORITY,
                ttl: DEFAULT_TTL_SECS,
                timestamp: now,
                source: source_protocol.as_str().to_owned(),
                correlation_id: None,
            },
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Set the time-to-live in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.metadata.ttl = ttl;
        self
    }

    /// Attach a correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether the event targets every user rather than one.
    pub fn is_global(&self) -> bool {
        self.user_id.is_empty()
    }

    /// Serialize as one newline-terminated JSON line.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NotificationEnvelope
// ─────────────────────────────────────────────────────────────────────────────

/// Envelope type tag for forwarded notifications.
pub const NOTIFICATION_TYPE: &str = "notification";

/// Errors raised while translating a forwarded envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The line was not valid JSON for an envelope.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The envelope `type` was not `"notification"`.
    #[error("unsupported envelope type: {0}")]
    UnsupportedType(String),
    /// The envelope named an event type the bridge does not know.
    #[error(transparent)]
    UnknownEventType(#[from] ParseNameError),
}

/// Envelope used to forward events between protocol server processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Always `"notification"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Wire name of the [`EventType`].
    pub event_type: String,
    /// Target user. Empty means global.
    #[serde(default)]
    pub user_id: String,
    /// Event payload. `null` decodes as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
}

impl NotificationEnvelope {
    /// Wrap an event for forwarding to another process.
    pub fn from_event(event: &UnifiedEvent) -> Self {
        Self {
            kind: NOTIFICATION_TYPE.to_owned(),
            event_type: event.event_type.as_str().to_owned(),
            user_id: event.user_id.clone(),
            data: event.data.clone(),
        }
    }

    /// Parse one JSON line.
    pub fn parse(line: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Translate into a local event attributed to `source_protocol`.
    pub fn into_event(self, source_protocol: ProtocolType) -> Result<UnifiedEvent, EnvelopeError> {
        if self.kind != NOTIFICATION_TYPE {
            return Err(EnvelopeError::UnsupportedType(self.kind));
        }
        let event_type: EventType = self.event_type.parse()?;
        Ok(UnifiedEvent::new(
            event_type,
            self.user_id,
            source_protocol,
            self.data,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn null_data_decodes_as_empty() {
        let env = NotificationEnvelope::parse(
            r#"{"type":"notification","event_type":"chapter_release","user_id":"u1","data":null}"#,
        )
        .unwrap();
        assert!(env.data.is_empty());
        let event = env.into_event(ProtocolType::Tcp).unwrap();
        assert_eq!(event.event_type, EventType::ChapterRelease);
        assert!(event.data.is_empty());

        let mut wire = serde_json::to_value(&event).unwrap();
        wire["data"] = Value::Null;
        let decoded: UnifiedEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.id, event.id);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn missing_data_decodes_as_empty() {
        let env = NotificationEnvelope::parse(
            r#"{"type":"notification","event_type":"progress_update","user_id":"u1"}"#,
        )
        .unwrap();
        assert!(env.data.is_empty());
    }

    #[test]
    fn new_fills_defaults() {
        let event = UnifiedEvent::new(
            EventType::ProgressUpdate,
            "user-1",
            ProtocolType::Tcp,
            payload(json!({"manga_id": "one-piece", "chapter": 1100})),
        );
        assert_eq!(event.user_id, "user-1");
        assert_eq!(event.metadata.priority, DEFAULT_PRIORITY);
        assert_eq!(event.metadata.ttl, DEFAULT_TTL_SECS);
        assert_eq!(event.metadata.source, "tcp");
        assert!(event.metadata.correlation_id.is_none());
        assert_eq!(event.metadata.timestamp, event.timestamp);
    }

    #[test]
    fn ids_are_unique_per_event() {
        let a = UnifiedEvent::new(EventType::HealthCheck, "", ProtocolType::Udp, Map::new());
        let b = UnifiedEvent::new(EventType::HealthCheck, "", ProtocolType::Udp, Map::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn builders_set_metadata() {
        let event = UnifiedEvent::new(EventType::SyncRequest, "u", ProtocolType::Grpc, Map::new())
            .with_priority(5)
            .with_ttl(10)
            .with_correlation_id("corr-1");
        assert_eq!(event.metadata.priority, 5);
        assert_eq!(event.metadata.ttl, 10);
        assert_eq!(event.metadata.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn empty_user_is_global() {
        let event = UnifiedEvent::new(EventType::ChapterRelease, "", ProtocolType::Udp, Map::new());
        assert!(event.is_global());
        let event = UnifiedEvent::new(EventType::ChapterRelease, "u", ProtocolType::Udp, Map::new());
        assert!(!event.is_global());
    }

    #[test]
    fn wire_shape_uses_fixed_field_names() {
        let event = UnifiedEvent::new(
            EventType::LibraryAdd,
            "user-9",
            ProtocolType::WebSocket,
            payload(json!({"manga_id": "berserk"})),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "library_add");
        assert_eq!(value["user_id"], "user-9");
        assert_eq!(value["source_protocol"], "websocket");
        assert_eq!(value["data"]["manga_id"], "berserk");
        assert_eq!(value["metadata"]["priority"], 1);
        assert_eq!(value["metadata"]["ttl"], 3600);
        assert_eq!(value["metadata"]["source"], "websocket");
        assert!(value["metadata"].get("correlation_id").is_none());
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn json_line_is_newline_terminated() {
        let event = UnifiedEvent::new(EventType::UserMessage, "u", ProtocolType::Tcp, Map::new());
        let line = event.to_json_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let back: UnifiedEvent = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn event_type_names_parse_back() {
        for event_type in EventType::ALL {
            let parsed: EventType = event_type.as_str().parse().unwrap();
            assert_eq!(parsed, event_type);
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
    }

    #[test]
    fn global_capable_types() {
        assert!(EventType::ChapterRelease.allows_global());
        assert!(EventType::UserMessage.allows_global());
        assert!(!EventType::ProgressUpdate.allows_global());
        assert!(!EventType::LibraryRemove.allows_global());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "teleport".parse::<EventType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown event type: teleport");
    }

    #[test]
    fn protocol_names() {
        assert_eq!(ProtocolType::WebSocket.to_string(), "websocket");
        assert_eq!("grpc".parse::<ProtocolType>().unwrap(), ProtocolType::Grpc);
        assert!("sctp".parse::<ProtocolType>().is_err());
        assert_eq!(
            serde_json::to_string(&ProtocolType::WebSocket).unwrap(),
            "\"websocket\""
        );
    }

    #[test]
    fn envelope_translates_to_event() {
        let line = r#"{"type":"notification","event_type":"chapter_release","user_id":"u1","data":{"chapter":42}}"#;
        let event = NotificationEnvelope::parse(line)
            .unwrap()
            .into_event(ProtocolType::Tcp)
            .unwrap();
        assert_eq!(event.event_type, EventType::ChapterRelease);
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.data["chapter"], 42);
        assert_eq!(event.source_protocol, ProtocolType::Tcp);
    }

    #[test]
    fn envelope_without_user_is_global() {
        let line = r#"{"type":"notification","event_type":"chapter_release"}"#;
        let event = NotificationEnvelope::parse(line)
            .unwrap()
            .into_event(ProtocolType::Udp)
            .unwrap();
        assert!(event.is_global());
        assert!(event.data.is_empty());
    }

    #[test]
    fn envelope_rejects_wrong_type() {
        let line = r#"{"type":"chat","event_type":"user_message"}"#;
        let err = NotificationEnvelope::parse(line)
            .unwrap()
            .into_event(ProtocolType::Tcp)
            .unwrap_err();
        assert_matches!(err, EnvelopeError::UnsupportedType(kind) if kind == "chat");
    }

    #[test]
    fn envelope_rejects_unknown_event_type() {
        let line = r#"{"type":"notification","event_type":"warp"}"#;
        let err = NotificationEnvelope::parse(line)
            .unwrap()
            .into_event(ProtocolType::Tcp)
            .unwrap_err();
        assert_matches!(err, EnvelopeError::UnknownEventType(_));
    }

    #[test]
    fn envelope_rejects_bad_json() {
        assert_matches!(
            NotificationEnvelope::parse("{not json"),
            Err(EnvelopeError::Json(_))
        );
    }

    #[test]
    fn envelope_from_event() {
        let event = UnifiedEvent::new(
            EventType::StatusChange,
            "u2",
            ProtocolType::Grpc,
            payload(json!({"status": "completed"})),
        );
        let envelope = NotificationEnvelope::from_event(&event);
        assert_eq!(envelope.kind, "notification");
        assert_eq!(envelope.event_type, "status_change");
        assert_eq!(envelope.user_id, "u2");
        assert_eq!(envelope.data["status"], "completed");
    }
}
