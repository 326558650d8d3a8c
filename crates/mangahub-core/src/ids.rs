//! Branded ID newtypes.
//!
//! Event IDs are UUID v7 strings: a millisecond timestamp followed by random
//! bits, so they sort by creation time and are never reused. Client IDs are
//! derived from the owning user, the protocol and the registration time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::events::ProtocolType;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a [`UnifiedEvent`](crate::UnifiedEvent).
    EventId
}

branded_id! {
    /// Identifier of one registered protocol connection.
    ClientId
}

impl EventId {
    /// Create a new time-ordered event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientId {
    /// Derive a client ID from its user, protocol and registration instant.
    ///
    /// `registered_at_nanos` is the Unix registration time; `sequence` breaks
    /// ties between registrations that land on the same clock reading.
    #[must_use]
    pub fn derive(
        user_id: &str,
        protocol: ProtocolType,
        registered_at_nanos: i64,
        sequence: u64,
    ) -> Self {
        Self(format!(
            "{user_id}_{protocol}_{registered_at_nanos}_{sequence}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_is_uuid_v7() {
        let id = EventId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn event_ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn event_ids_sort_by_creation() {
        let first = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EventId::new();
        assert!(first.as_str() < second.as_str());
    }

    #[test]
    fn client_id_is_deterministic() {
        let a = ClientId::derive("user-1", ProtocolType::Tcp, 1_700_000_000, 7);
        let b = ClientId::derive("user-1", ProtocolType::Tcp, 1_700_000_000, 7);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "user-1_tcp_1700000000_7");
    }

    #[test]
    fn client_id_differs_by_protocol_and_sequence() {
        let tcp = ClientId::derive("u", ProtocolType::Tcp, 1, 0);
        let udp = ClientId::derive("u", ProtocolType::Udp, 1, 0);
        let tcp_next = ClientId::derive("u", ProtocolType::Tcp, 1, 1);
        assert_ne!(tcp, udp);
        assert_ne!(tcp, tcp_next);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ClientId::from("c-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c-1\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_and_deref() {
        let id = EventId::from("evt");
        assert_eq!(format!("{id}"), "evt");
        let s: &str = &id;
        assert_eq!(s, "evt");
        assert_eq!(String::from(id), "evt");
    }
}
