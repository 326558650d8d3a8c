//! # mangahub-core
//!
//! Foundation types shared by every MangaHub crate.
//!
//! - **Branded IDs**: `EventId`, `ClientId` as newtypes for type safety
//! - **Events**: `UnifiedEvent` with its closed `EventType` set and `EventMetadata`
//! - **Protocols**: `ProtocolType` tags for the four client transports
//! - **Envelopes**: `NotificationEnvelope` for cross-process forwarding
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;

pub use events::{
    EnvelopeError, EventMetadata, EventType, NotificationEnvelope, ParseNameError, ProtocolType,
    UnifiedEvent,
};
pub use ids::{ClientId, EventId};
