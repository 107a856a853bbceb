//! Queue topology descriptors: exchanges, queues, bindings, dead-letter wiring.
//!
//! A [`QueueTopology`] is created once at startup and stays immutable for the
//! process lifetime. The broker implementation declares it before consumption
//! begins; declaring an identical topology again is a no-op, declaring a
//! conflicting one fails loudly (see [`crate::BrokerError::TopologyConflict`]).
//!
//! # Dead-Letter Wiring
//!
//! The dead-letter queue is declared with two structural arguments that are
//! part of the protocol, not free-form options:
//!
//! - a dead-letter-exchange reference **back to the primary exchange**, and
//! - a per-message TTL equal to the quarantine interval.
//!
//! Together they form the recovery loop: a message that exhausts its retry
//! budget is rejected into the dead-letter queue, sits there (no consumer)
//! until the TTL expires, and is then republished by the broker to the primary
//! exchange for a fresh attempt cycle. No custom scheduler is involved.

use std::time::Duration;

/// How long dead-lettered messages are quarantined before the broker
/// republishes them to the primary exchange.
pub const DEFAULT_QUARANTINE_TTL: Duration = Duration::from_secs(60);

/// The kind of primary exchange to declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver every message to every bound queue.
    Fanout,
    /// Route by routing key pattern.
    Topic,
}

/// Per-queue processing order contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingOrder {
    /// One in-flight message at a time, preserving broker-delivery order.
    ///
    /// Required when a processor's side effects are order-sensitive, e.g. the
    /// last-write-wins search projections.
    Sequential,

    /// Multiple in-flight messages for throughput.
    ///
    /// Only safe when side effects are commutative or idempotent, e.g.
    /// independent mail sends.
    Concurrent {
        /// Maximum number of messages processed at once.
        max_in_flight: usize,
    },
}

impl ProcessingOrder {
    /// The in-flight message limit this order implies.
    #[must_use]
    pub const fn max_in_flight(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Concurrent { max_in_flight } => max_in_flight,
        }
    }
}

/// Declares the broker-side shape of one consumption pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    /// Primary exchange producers publish to.
    pub exchange: String,
    /// Kind of the primary exchange.
    pub exchange_kind: ExchangeKind,
    /// Primary queue this consumer reads from.
    pub queue: String,
    /// Binding keys from the primary exchange to the queue (`"#"` = catch-all).
    pub routing_keys: Vec<String>,
    /// Dead-letter exchange (always fanout).
    pub dead_letter_exchange: String,
    /// Dead-letter queue, bound to the dead-letter exchange.
    pub dead_letter_queue: String,
    /// Quarantine interval before dead-lettered messages are requeued.
    pub quarantine_ttl: Duration,
    /// Sequential or concurrent consumption.
    pub processing_order: ProcessingOrder,
}

impl QueueTopology {
    /// Start building a topology for the given primary exchange and queue.
    #[must_use]
    pub fn builder(exchange: impl Into<String>, queue: impl Into<String>) -> QueueTopologyBuilder {
        QueueTopologyBuilder {
            exchange: exchange.into(),
            exchange_kind: ExchangeKind::Topic,
            queue: queue.into(),
            routing_keys: vec!["#".to_string()],
            dead_letter_exchange: None,
            dead_letter_queue: None,
            quarantine_ttl: DEFAULT_QUARANTINE_TTL,
            processing_order: ProcessingOrder::Sequential,
        }
    }
}

/// Builder for [`QueueTopology`].
#[derive(Clone, Debug)]
pub struct QueueTopologyBuilder {
    exchange: String,
    exchange_kind: ExchangeKind,
    queue: String,
    routing_keys: Vec<String>,
    dead_letter_exchange: Option<String>,
    dead_letter_queue: Option<String>,
    quarantine_ttl: Duration,
    processing_order: ProcessingOrder,
}

impl QueueTopologyBuilder {
    /// Set the primary exchange kind (default: topic).
    #[must_use]
    pub const fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    /// Set the binding keys (default: `"#"` catch-all).
    #[must_use]
    pub fn routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the dead-letter exchange name (default: `"{exchange}.dead"`).
    #[must_use]
    pub fn dead_letter_exchange(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(name.into());
        self
    }

    /// Set the dead-letter queue name (default: `"{dead_letter_exchange}-dlq"`).
    #[must_use]
    pub fn dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    /// Set the quarantine TTL (default: 60 seconds).
    #[must_use]
    pub const fn quarantine_ttl(mut self, ttl: Duration) -> Self {
        self.quarantine_ttl = ttl;
        self
    }

    /// Set the processing order (default: sequential).
    #[must_use]
    pub const fn processing_order(mut self, order: ProcessingOrder) -> Self {
        self.processing_order = order;
        self
    }

    /// Build the immutable [`QueueTopology`].
    #[must_use]
    pub fn build(self) -> QueueTopology {
        let dead_letter_exchange = self
            .dead_letter_exchange
            .unwrap_or_else(|| format!("{}.dead", self.exchange));
        let dead_letter_queue = self
            .dead_letter_queue
            .unwrap_or_else(|| format!("{dead_letter_exchange}-dlq"));
        QueueTopology {
            exchange: self.exchange,
            exchange_kind: self.exchange_kind,
            queue: self.queue,
            routing_keys: self.routing_keys,
            dead_letter_exchange,
            dead_letter_queue,
            quarantine_ttl: self.quarantine_ttl,
            processing_order: self.processing_order,
        }
    }
}
