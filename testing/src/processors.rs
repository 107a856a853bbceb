//! Scripted processors for exercising the retry discipline.

use agora_core::{ProcessFuture, ProcessingError, Processor};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A processor that fails transiently a fixed number of times, then succeeds.
///
/// `FlakyProcessor::new(usize::MAX)` never succeeds, which is the shortest
/// way to script a poison message.
pub struct FlakyProcessor {
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyProcessor {
    /// Fail the first `failures` attempts with a transient error.
    #[must_use]
    pub const fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Total number of attempts observed so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<M: Send + Sync> Processor<M> for FlakyProcessor {
    fn process<'a>(&'a self, _message: &'a M) -> ProcessFuture<'a> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(ProcessingError::Transient(format!(
                    "scripted failure on attempt {attempt}"
                )))
            } else {
                Ok(())
            }
        })
    }
}

/// A processor that always succeeds and counts its invocations.
#[derive(Default)]
pub struct CountingProcessor {
    calls: AtomicUsize,
}

impl CountingProcessor {
    /// Create a processor with a zeroed counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of messages processed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<M: Send + Sync> Processor<M> for CountingProcessor {
    fn process<'a>(&'a self, _message: &'a M) -> ProcessFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
