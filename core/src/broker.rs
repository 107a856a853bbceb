//! Message broker abstraction consumed by the pipeline.
//!
//! Two implementations exist: the AMQP broker (`agora-amqp`, production) and
//! the in-memory broker (`agora-testing`, for tests). Both honor the same
//! contract:
//!
//! - [`MessageBroker::declare_topology`] is idempotent for identical
//!   parameters and fails with [`BrokerError::TopologyConflict`] for divergent
//!   ones, never silently
//! - [`MessageBroker::subscribe`] hands back a stream of [`Delivery`] values
//!   that must each be settled exactly once, by [`Delivery::ack`] or
//!   [`Delivery::dead_letter`]
//! - unsettled deliveries return to the broker when the consumer goes away,
//!   preserving at-least-once semantics across restarts

use crate::BoxFuture;
use crate::topology::QueueTopology;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not reach or authenticate with the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// A declaration conflicts with existing broker state.
    ///
    /// Always fatal: it implies broker schema drift that would cause silent
    /// message loss later.
    #[error("Topology conflict on '{name}': {reason}")]
    TopologyConflict {
        /// The exchange or queue whose declaration conflicted.
        name: String,
        /// The broker's reason.
        reason: String,
    },

    /// Failed to register the consumer on a queue.
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscribeFailed {
        /// The queue that could not be subscribed.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to publish a message.
    #[error("Publish failed on exchange '{exchange}': {reason}")]
    PublishFailed {
        /// The target exchange.
        exchange: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to settle (ack or reject) a delivery.
    #[error("Failed to settle delivery: {0}")]
    SettleFailed(String),

    /// Transport-level failure while consuming.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Settles a delivery with the broker. Implemented per broker.
pub trait Acknowledger: Send {
    /// Acknowledge successful processing; the message is done.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;

    /// Reject the message without requeue, routing it to the dead-letter
    /// exchange configured on the queue.
    fn dead_letter(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;
}

/// One message handed to the consumer, pending settlement.
pub struct Delivery {
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker flagged this delivery as a redelivery.
    pub redelivered: bool,
    /// How many dead-letter quarantine cycles this message has been through.
    ///
    /// Taken from the broker's own dead-letter accounting (`x-death` on AMQP).
    /// Zero for a first delivery.
    pub requeue_count: u64,
    acknowledger: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery. Called by broker implementations.
    #[must_use]
    pub fn new(
        payload: Vec<u8>,
        routing_key: String,
        redelivered: bool,
        requeue_count: u64,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            routing_key,
            redelivered,
            requeue_count,
            acknowledger,
        }
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SettleFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acknowledger.ack().await
    }

    /// Route this message to the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SettleFailed`] if the broker rejects the nack.
    pub async fn dead_letter(self) -> Result<(), BrokerError> {
        self.acknowledger.dead_letter().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("requeue_count", &self.requeue_count)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a queue subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Trait for message broker implementations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single broker handle is shared by
/// every consumer in the process and any long-lived connection behind it is
/// opened lazily exactly once, guarded against concurrent-open races.
///
/// # Dyn Compatibility
///
/// Uses explicit boxed-future returns so consumers can hold
/// `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Declare the exchanges, queues, bindings and dead-letter wiring of a
    /// topology on the broker.
    ///
    /// Runs once at startup, before consumption, over a short-lived
    /// administrative connection that is closed immediately afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopologyConflict`] when existing broker state
    /// disagrees with the descriptor, [`BrokerError::ConnectionFailed`] when
    /// the broker is unreachable.
    fn declare_topology<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Open the long-lived subscription on the topology's primary queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscribeFailed`] or
    /// [`BrokerError::ConnectionFailed`]; the caller wraps this in the
    /// bounded startup retry guard.
    fn subscribe<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<DeliveryStream, BrokerError>>;

    /// Publish a raw payload to an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker refuses the
    /// message.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), BrokerError>>;
}
