//! The processor contract: one handler per event type, typed failure modes.
//!
//! A processor performs the side effect for a single message: upserting a
//! search document, sending a mail letter. The pipeline wraps every invocation
//! in a bounded-retry policy, so the contract distinguishes failures the retry
//! policy should absorb from failures that can never succeed:
//!
//! - [`ProcessingError::Transient`]: collaborator timeout, temporary
//!   unavailability; retried with exponential backoff, dead-lettered once the
//!   budget is exhausted
//! - [`ProcessingError::Permanent`]: the message can never be processed (an
//!   unparseable address, an entity that no longer exists); dead-lettered
//!   immediately without burning the retry budget

use crate::BoxFuture;
use thiserror::Error;

/// A processing failure reported by a processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// A failure that may succeed on retry.
    #[error("transient processing failure: {0}")]
    Transient(String),

    /// A failure that will never succeed no matter how often it is retried.
    #[error("permanent processing failure: {0}")]
    Permanent(String),
}

impl ProcessingError {
    /// Whether the retry policy should retry this failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Future returned by [`Processor::process`].
pub type ProcessFuture<'a> = BoxFuture<'a, Result<(), ProcessingError>>;

/// A handler that performs the side effect for one message.
///
/// Implementations are registered with the router at startup and owned by its
/// dispatch table for the process lifetime; they hold their collaborators
/// (entity readers, the search store, the mail transport) behind trait objects.
///
/// # At-Least-Once
///
/// A processor may see the same message more than once: after a crash before
/// acknowledgement, or after a dead-letter quarantine cycle. Side effects must
/// either be idempotent (recompute-and-upsert) or the duplicate must be an
/// accepted trade (mail delivery).
///
/// # Dyn Compatibility
///
/// Uses an explicit boxed-future return instead of `async fn` so routers can
/// hold `Arc<dyn Processor<M>>` dispatch tables.
pub trait Processor<M>: Send + Sync {
    /// Process a single message.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::Transient`] for failures worth retrying and
    /// [`ProcessingError::Permanent`] for failures that never will be.
    fn process<'a>(&'a self, message: &'a M) -> ProcessFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(ProcessingError::Transient("smtp timeout".into()).is_transient());
        assert!(!ProcessingError::Permanent("entity gone".into()).is_transient());
    }

    #[test]
    fn errors_render_their_cause() {
        let err = ProcessingError::Transient("index store unavailable".to_string());
        assert!(err.to_string().contains("index store unavailable"));
    }
}
