//! The generic event envelope carried over the message bus.
//!
//! Producers across the platform publish a small, uniform envelope: an event
//! type tag, the id of the entity the event concerns, and a timestamp. The
//! consumer side routes on the type tag alone; the payload is optional and
//! event-specific.
//!
//! # Forward Compatibility
//!
//! The event type set is closed but versionable. A producer running a newer
//! version of the platform may emit types this consumer has never heard of:
//! those deserialize to [`EventType::Unknown`] and are acknowledged without
//! processing, rather than rejected. Unknown *fields* in the envelope are
//! ignored for the same reason.
//!
//! # Wire Shape
//!
//! ```json
//! { "eventType": "changed.topic", "entityId": "…", "occurredAt": "…", "payload": { } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The payload could not be decoded as an envelope at all.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// The envelope could not be encoded for publishing.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Message queue event type.
///
/// One tag per domain event the platform emits. Routing keys follow the
/// `"{verb}.{entity}"` convention and double as the serialized representation
/// on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A new user has registered.
    #[serde(rename = "new.user")]
    NewUser,

    /// A new forum topic has been created.
    #[serde(rename = "new.topic")]
    NewTopic,

    /// A forum topic has been updated.
    #[serde(rename = "changed.topic")]
    ChangedTopic,

    /// A forum topic has been deleted.
    #[serde(rename = "deleted.topic")]
    DeletedTopic,

    /// A new forum comment has been posted.
    #[serde(rename = "new.forum.comment")]
    NewForumComment,

    /// A forum comment has been edited.
    #[serde(rename = "changed.forum.comment")]
    ChangedForumComment,

    /// A forum comment has been deleted.
    #[serde(rename = "deleted.forum.comment")]
    DeletedForumComment,

    /// A mail letter has been requested for delivery.
    #[serde(rename = "requested.mail")]
    MailRequested,

    /// An event type this consumer version does not know about.
    ///
    /// Produced by newer platform versions; swallowed by the router rather
    /// than retried, so a forward-compatible producer never poison-loops an
    /// older consumer.
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// The broker routing key for this event type.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::NewUser => "new.user",
            Self::NewTopic => "new.topic",
            Self::ChangedTopic => "changed.topic",
            Self::DeletedTopic => "deleted.topic",
            Self::NewForumComment => "new.forum.comment",
            Self::ChangedForumComment => "changed.forum.comment",
            Self::DeletedForumComment => "deleted.forum.comment",
            Self::MailRequested => "requested.mail",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// An immutable domain event envelope.
///
/// Carries just enough to route and to identify the affected entity; the
/// processors load current entity state from the system of record rather than
/// trusting a snapshot in the message, which keeps them idempotent under
/// redelivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The event type tag used for routing.
    pub event_type: EventType,

    /// The id of the entity this event concerns.
    pub entity_id: Uuid,

    /// When the event occurred at the producer.
    pub occurred_at: DateTime<Utc>,

    /// Optional event-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    /// Create an envelope occurring now.
    #[must_use]
    pub fn new(event_type: EventType, entity_id: Uuid) -> Self {
        Self {
            event_type,
            entity_id,
            occurred_at: Utc::now(),
            payload: None,
        }
    }

    /// Attach an event-specific payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// Unknown fields are ignored and unknown event types map to
    /// [`EventType::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }

    /// Encode the envelope into its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}
