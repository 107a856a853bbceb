//! # Agora Testing
//!
//! Test doubles for the event pipeline: an in-memory [`MessageBroker`] with
//! real dead-letter quarantine semantics, and scripted processors for
//! exercising the retry discipline.
//!
//! The broker runs on tokio time, so tests started with
//! `#[tokio::test(start_paused = true)]` can advance the clock through
//! backoff waits and the 60-second quarantine without wall-clock delay.

pub mod broker;
pub mod processors;

pub use broker::InMemoryBroker;
pub use processors::{CountingProcessor, FlakyProcessor};
