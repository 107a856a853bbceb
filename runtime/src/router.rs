//! Type-based routing of event envelopes to registered processors.
//!
//! The router is a pure dispatch table: [`EventType`] → processor. It is
//! constructed once at startup from the full set of registrations and never
//! mutated afterwards; exactly one router instance exists per consuming
//! process.
//!
//! Unregistered and [`EventType::Unknown`] types are acknowledged without
//! invoking anything: a newer producer must never be able to poison-loop an
//! older consumer (see [`crate::retry`] for what would happen if they were
//! treated as failures instead).

use agora_core::{Envelope, EventType, ProcessFuture, Processor};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable dispatch table from event type to processor.
///
/// Multiple event types may map to the same processor instance (every
/// "changed X" event of one entity kind goes to the same indexer).
///
/// # Example
///
/// ```ignore
/// let router = EventRouter::builder()
///     .register(EventType::NewTopic, Arc::clone(&topic_indexer))
///     .register(EventType::ChangedTopic, topic_indexer)
///     .register(EventType::DeletedTopic, deletion_indexer)
///     .build();
/// ```
pub struct EventRouter {
    routes: HashMap<EventType, Arc<dyn Processor<Envelope>>>,
}

impl EventRouter {
    /// Create a router builder.
    #[must_use]
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder {
            routes: HashMap::new(),
        }
    }

    /// The event types with a registered processor.
    pub fn registered_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.routes.keys().copied()
    }
}

impl Processor<Envelope> for EventRouter {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
        Box::pin(async move {
            let Some(processor) = self.routes.get(&envelope.event_type) else {
                tracing::debug!(
                    event_type = %envelope.event_type,
                    entity_id = %envelope.entity_id,
                    "No processor registered for event type, discarding"
                );
                return Ok(());
            };

            processor.process(envelope).await
        })
    }
}

/// Builder for [`EventRouter`]. Registration is fixed once `build` is called.
pub struct EventRouterBuilder {
    routes: HashMap<EventType, Arc<dyn Processor<Envelope>>>,
}

impl EventRouterBuilder {
    /// Register a processor for an event type.
    ///
    /// A later registration for the same type replaces the earlier one.
    #[must_use]
    pub fn register(mut self, event_type: EventType, processor: Arc<dyn Processor<Envelope>>) -> Self {
        self.routes.insert(event_type, processor);
        self
    }

    /// Build the immutable router.
    #[must_use]
    pub fn build(self) -> EventRouter {
        EventRouter {
            routes: self.routes,
        }
    }
}
