//! # Agora AMQP
//!
//! AMQP implementation of the [`agora_core::MessageBroker`] contract, built on
//! [lapin].
//!
//! # Connection Discipline
//!
//! - **Topology declaration** runs over a short-lived administrative
//!   connection that is closed as soon as the declarations succeed. Startup
//!   schema work never shares a connection with consumption.
//! - **Consumption and publishing** share one long-lived connection, opened
//!   lazily on first use and guarded against concurrent-open races. Each
//!   subscription gets its own channel with a prefetch window derived from the
//!   topology's processing order.
//!
//! # Dead-Letter Wiring
//!
//! The dead-letter queue is declared with `x-dead-letter-exchange` pointing
//! back at the primary exchange and `x-message-ttl` set to the quarantine
//! interval, so the broker itself requeues quarantined messages. See
//! [`agora_core::QueueTopology`] for the full picture.
//!
//! [lapin]: https://docs.rs/lapin

pub mod broker;
pub mod config;

pub use broker::AmqpBroker;
pub use config::AmqpConfig;
