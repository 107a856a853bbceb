//! # Agora Core
//!
//! Core traits and types for the Agora event-processing pipeline.
//!
//! This crate defines the shared vocabulary of the pipeline: the generic event
//! envelope flowing over the message bus, the [`Processor`] contract that
//! concrete handlers (search indexers, the mail sender) implement, the queue
//! topology descriptor, and the [`MessageBroker`] abstraction that both the
//! AMQP implementation and the in-memory test broker satisfy.
//!
//! ## Delivery Semantics
//!
//! The pipeline is built around **at-least-once delivery**:
//!
//! - Messages are acknowledged only after a processor reports success
//! - A message that exhausts its retry budget is dead-lettered, quarantined for
//!   a fixed interval, then republished to the primary exchange by the broker
//! - Processors must therefore be idempotent (the indexers recompute the full
//!   document on every event; duplicate mail delivery is an accepted trade)
//!
//! ## Example
//!
//! ```ignore
//! use agora_core::{Envelope, EventType, Processor, ProcessingError};
//!
//! struct TopicIndexer { /* collaborators */ }
//!
//! impl Processor<Envelope> for TopicIndexer {
//!     fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
//!         Box::pin(async move {
//!             // load entity, recompute projection, upsert into the index
//!             Ok(())
//!         })
//!     }
//! }
//! ```

pub mod broker;
pub mod envelope;
pub mod processor;
pub mod topology;

pub use broker::{Acknowledger, BrokerError, Delivery, DeliveryStream, MessageBroker};
pub use envelope::{Envelope, EnvelopeError, EventType};
pub use processor::{ProcessFuture, ProcessingError, Processor};
pub use topology::{ExchangeKind, ProcessingOrder, QueueTopology, QueueTopologyBuilder};

use std::future::Future;
use std::pin::Pin;

/// Boxed future type used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
