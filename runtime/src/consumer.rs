//! The queue consumer: topology setup, guarded subscription, per-message
//! retry discipline, and dead-letter routing.
//!
//! One [`QueueConsumer`] drives one queue. It is generic over the message
//! type `M` so the same machinery serves both the envelope-routing pipelines
//! (search indexing) and queues that carry a concrete payload directly (mail
//! letters).
//!
//! # Lifecycle
//!
//! 1. Declare the topology (idempotent; a conflict is fatal)
//! 2. Subscribe under the bounded startup guard, up to 5 retries with
//!    exponential backoff, then the error propagates and the process is
//!    considered unable to start
//! 3. Drive the delivery stream until shutdown: decode, process under the
//!    per-message retry policy, ack on success, dead-letter on exhaustion
//!
//! # Shutdown
//!
//! Signalling the `watch` sender stops intake of new deliveries. An attempt
//! already in flight runs to completion, but retries still waiting in backoff
//! are abandoned and their deliveries stay unsettled, so the broker
//! redelivers them on the next start.

use crate::retry::{RetryOutcome, RetryPolicy, retry_until_shutdown, retry_with_backoff};
use agora_core::{BrokerError, Delivery, MessageBroker, ProcessingError, Processor, QueueTopology};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::watch;

/// Errors that terminate a consumer before or during startup.
///
/// Processing failures never surface here; they are absorbed by the retry
/// policy and the dead-letter cycle.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Topology declaration failed; startup must not proceed.
    #[error("Topology declaration failed: {0}")]
    Topology(#[source] BrokerError),

    /// The startup subscribe guard exhausted its retry budget.
    #[error("Could not subscribe to queue '{queue}' after {attempts} attempts: {source}")]
    Subscribe {
        /// The queue that could not be subscribed.
        queue: String,
        /// Total connection attempts made.
        attempts: usize,
        /// The final broker error.
        #[source]
        source: BrokerError,
    },
}

/// A reliable consumer for one queue.
///
/// # Example
///
/// ```ignore
/// let (mut consumer, shutdown) = QueueConsumer::new(broker, search_topology(), router);
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
/// consumer.start().await?;
/// ```
pub struct QueueConsumer<M> {
    broker: Arc<dyn MessageBroker>,
    topology: QueueTopology,
    processor: Arc<dyn Processor<M>>,
    message_retry: RetryPolicy,
    subscribe_retry: RetryPolicy,
    requeue_alert_threshold: Option<u64>,
    shutdown: watch::Receiver<bool>,
}

impl<M> QueueConsumer<M>
where
    M: DeserializeOwned + Send + Sync,
{
    /// Create a consumer with the default retry shape (5 retries, 1 s initial
    /// delay, doubling) for both the startup guard and per-message policy.
    ///
    /// Returns the consumer and a shutdown sender; send `true` to stop
    /// gracefully.
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: QueueTopology,
        processor: Arc<dyn Processor<M>>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Self {
            broker,
            topology,
            processor,
            message_retry: RetryPolicy::default(),
            subscribe_retry: RetryPolicy::default(),
            requeue_alert_threshold: None,
            shutdown: shutdown_rx,
        };
        (consumer, shutdown_tx)
    }

    /// Override the per-message retry policy.
    #[must_use]
    pub fn with_message_retry(mut self, policy: RetryPolicy) -> Self {
        self.message_retry = policy;
        self
    }

    /// Override the startup subscribe retry policy.
    #[must_use]
    pub fn with_subscribe_retry(mut self, policy: RetryPolicy) -> Self {
        self.subscribe_retry = policy;
        self
    }

    /// Log an error-level alert when a delivery has been through at least
    /// this many dead-letter quarantine cycles.
    ///
    /// The message still gets its attempt cycle; nothing is dropped. A
    /// persistently failing message cycles between the primary and
    /// dead-letter queues indefinitely by design; this is the operator's
    /// visibility hook into that loop.
    #[must_use]
    pub const fn with_requeue_alert_threshold(mut self, threshold: u64) -> Self {
        self.requeue_alert_threshold = Some(threshold);
        self
    }

    /// Declare topology, subscribe, and process deliveries until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Topology`] on a declaration conflict and
    /// [`ConsumerError::Subscribe`] once the startup guard is exhausted; both
    /// are fatal to the process by policy (an external supervisor restarts
    /// it).
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        tracing::info!(
            queue = %self.topology.queue,
            exchange = %self.topology.exchange,
            dead_letter_queue = %self.topology.dead_letter_queue,
            order = ?self.topology.processing_order,
            "Starting consumer pipeline"
        );

        self.broker
            .declare_topology(&self.topology)
            .await
            .map_err(ConsumerError::Topology)?;

        // Broker availability and service startup are not ordered in the
        // deployment topology; the guard masks that race. Exhaustion is a
        // genuine misconfiguration and propagates.
        let stream = retry_with_backoff(self.subscribe_retry.clone(), || {
            self.broker.subscribe(&self.topology)
        })
        .await
        .map_err(|source| ConsumerError::Subscribe {
            queue: self.topology.queue.clone(),
            attempts: self.subscribe_retry.max_retries + 1,
            source,
        })?;

        tracing::info!(queue = %self.topology.queue, "Consumer is listening");

        let mut shutdown = self.shutdown.clone();
        let stop = async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    // Shutdown handle dropped without signalling: run until
                    // the delivery stream itself ends.
                    std::future::pending::<()>().await;
                }
            }
        };

        let limit = self.topology.processing_order.max_in_flight();
        stream
            .take_until(Box::pin(stop))
            .for_each_concurrent(Some(limit), |delivery| async {
                match delivery {
                    Ok(delivery) => self.handle_delivery(delivery).await,
                    Err(e) => {
                        tracing::error!(
                            queue = %self.topology.queue,
                            error = %e,
                            "Error receiving delivery from broker"
                        );
                    }
                }
            })
            .await;

        tracing::info!(queue = %self.topology.queue, "Consumer stopped");
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        if self
            .requeue_alert_threshold
            .is_some_and(|threshold| delivery.requeue_count >= threshold)
        {
            tracing::error!(
                queue = %self.topology.queue,
                routing_key = %delivery.routing_key,
                requeue_count = delivery.requeue_count,
                "Message keeps cycling through the dead-letter queue; manual inspection advised"
            );
        }

        let message: M = match serde_json::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    queue = %self.topology.queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Undecodable payload, routing to dead-letter queue"
                );
                metrics::counter!("pipeline.messages.undecodable").increment(1);
                Self::settle_dead_letter(delivery).await;
                return;
            }
        };

        let attempts = AtomicUsize::new(0);
        let mut shutdown = self.shutdown.clone();
        let outcome = retry_until_shutdown(
            self.message_retry.clone(),
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                    metrics::counter!("pipeline.messages.retried").increment(1);
                }
                self.processor.process(&message)
            },
            ProcessingError::is_transient,
            &mut shutdown,
        )
        .await;

        match outcome {
            RetryOutcome::Interrupted => {
                // Neither acked nor dead-lettered: the delivery stays
                // unsettled and the broker redelivers it after we disconnect.
                tracing::info!(
                    queue = %self.topology.queue,
                    routing_key = %delivery.routing_key,
                    "Shutdown during backoff, leaving delivery unsettled for redelivery"
                );
            }
            RetryOutcome::Completed(Ok(())) => {
                metrics::counter!("pipeline.messages.processed").increment(1);
                if let Err(e) = delivery.ack().await {
                    tracing::error!(
                        queue = %self.topology.queue,
                        error = %e,
                        "Failed to acknowledge delivery (message may be redelivered)"
                    );
                }
            }
            RetryOutcome::Completed(Err(failure)) => {
                tracing::warn!(
                    queue = %self.topology.queue,
                    routing_key = %delivery.routing_key,
                    attempts = attempts.load(Ordering::SeqCst),
                    error = %failure,
                    "Processing exhausted, routing message to dead-letter queue"
                );
                metrics::counter!("pipeline.messages.dead_lettered").increment(1);
                Self::settle_dead_letter(delivery).await;
            }
        }
    }

    async fn settle_dead_letter(delivery: Delivery) {
        if let Err(e) = delivery.dead_letter().await {
            tracing::error!(error = %e, "Failed to dead-letter delivery");
        }
    }
}
