//! # Agora Runtime
//!
//! The consumer pipeline runtime: retry policies, the event router, and the
//! queue consumer that ties broker, router and retry discipline together.
//!
//! # Data Flow
//!
//! ```text
//! broker ──► QueueConsumer ──► decode ──► Processor (router or direct)
//!                │                            │
//!                │          ┌─────────────────┤
//!                │          ▼                 ▼
//!                │      retry with        success
//!                │      backoff (≤5)         │
//!                │          │                ▼
//!                │      exhausted           ack
//!                │          ▼
//!                └──── dead-letter ──► [quarantine TTL] ──► broker requeue
//! ```
//!
//! The consumer never crashes on a processing failure; only startup
//! connectivity exhaustion and topology conflicts escalate to the caller.

pub mod consumer;
pub mod retry;
pub mod router;

pub use consumer::{ConsumerError, QueueConsumer};
pub use retry::{
    RetryOutcome, RetryPolicy, RetryPolicyBuilder, retry_until_shutdown, retry_with_backoff,
    retry_with_predicate,
};
pub use router::{EventRouter, EventRouterBuilder};
