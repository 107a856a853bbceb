//! In-memory message broker with dead-letter quarantine.
//!
//! Implements the full [`MessageBroker`] contract:
//!
//! - topology declaration is idempotent for identical parameters and fails
//!   with [`BrokerError::TopologyConflict`] for divergent ones
//! - rejected deliveries route to the dead-letter exchange with an
//!   incremented cycle count
//! - messages in a dead-letter queue sit for the quarantine TTL and are then
//!   republished to the exchange the queue's requeue rule points back to
//!   (the same native TTL-expiry-to-requeue mechanism the production broker
//!   provides, driven here by `tokio::time`)

use agora_core::{
    Acknowledger, BoxFuture, BrokerError, Delivery, DeliveryStream, ExchangeKind, MessageBroker,
    QueueTopology,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    requeue_count: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>, // (pattern, queue)
}

struct RequeueRule {
    target_exchange: String,
    ttl: Duration,
}

struct QueueState {
    sender: mpsc::UnboundedSender<StoredMessage>,
    receiver: Option<mpsc::UnboundedReceiver<StoredMessage>>,
    requeue: Option<RequeueRule>,
    depth: Arc<AtomicUsize>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

/// An in-memory broker for tests.
///
/// Cheap to clone-share via [`Arc`]; every handle sees the same topology and
/// queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently sitting in a queue.
    ///
    /// For a dead-letter queue this is the number of quarantined messages.
    /// Returns zero for undeclared queues.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.depth.load(Ordering::SeqCst))
    }

    /// Publish directly to a queue, bypassing exchange routing.
    ///
    /// Convenient for tests that want to seed a queue without a topology.
    pub fn publish_to_queue(&self, queue: &str, payload: &[u8]) {
        let state = self.lock();
        if let Some(q) = state.queues.get(queue) {
            q.depth.fetch_add(1, Ordering::SeqCst);
            let _ = q.sender.send(StoredMessage {
                payload: payload.to_vec(),
                routing_key: String::new(),
                redelivered: false,
                requeue_count: 0,
            });
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens if a holder panicked; tests should see that.
        self.state.lock().unwrap()
    }

    fn declare_exchange(
        state: &mut State,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), BrokerError> {
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::TopologyConflict {
                name: name.to_string(),
                reason: format!("declared as {:?}, requested {kind:?}", existing.kind),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        state: &mut State,
        name: &str,
        requeue: Option<RequeueRule>,
    ) -> Result<(), BrokerError> {
        if let Some(existing) = state.queues.get(name) {
            let same = match (&existing.requeue, &requeue) {
                (None, None) => true,
                (Some(a), Some(b)) => a.target_exchange == b.target_exchange && a.ttl == b.ttl,
                _ => false,
            };
            if same {
                return Ok(());
            }
            return Err(BrokerError::TopologyConflict {
                name: name.to_string(),
                reason: "queue already declared with different dead-letter arguments".to_string(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.insert(
            name.to_string(),
            QueueState {
                sender,
                receiver: Some(receiver),
                requeue,
                depth: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    fn bind(state: &mut State, exchange: &str, pattern: &str, queue: &str) {
        if let Some(ex) = state.exchanges.get_mut(exchange) {
            let binding = (pattern.to_string(), queue.to_string());
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
        }
    }

    /// Route a message through an exchange into its bound queues.
    fn route(
        state: &State,
        broker: &Arc<Mutex<State>>,
        exchange: &str,
        message: &StoredMessage,
    ) -> Result<(), BrokerError> {
        let Some(ex) = state.exchanges.get(exchange) else {
            return Err(BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: "exchange not declared".to_string(),
            });
        };

        let targets: Vec<&str> = ex
            .bindings
            .iter()
            .filter(|(pattern, _)| {
                ex.kind == ExchangeKind::Fanout || topic_matches(pattern, &message.routing_key)
            })
            .map(|(_, queue)| queue.as_str())
            .collect();

        for queue_name in targets {
            if let Some(queue) = state.queues.get(queue_name) {
                queue.depth.fetch_add(1, Ordering::SeqCst);
                if let Some(rule) = &queue.requeue {
                    // Quarantine: hold the message for the TTL, then republish
                    // it to the rule's target exchange for a fresh cycle.
                    let broker = Arc::clone(broker);
                    let target = rule.target_exchange.clone();
                    let ttl = rule.ttl;
                    let depth = Arc::clone(&queue.depth);
                    let mut requeued = message.clone();
                    requeued.redelivered = true;
                    tokio::spawn(async move {
                        tokio::time::sleep(ttl).await;
                        depth.fetch_sub(1, Ordering::SeqCst);
                        #[allow(clippy::unwrap_used)]
                        let state = broker.lock().unwrap();
                        if let Err(e) = Self::route(&state, &broker, &target, &requeued) {
                            tracing::warn!(error = %e, "Dead-letter requeue failed");
                        }
                    });
                } else {
                    let _ = queue.sender.send(message.clone());
                }
            }
        }
        Ok(())
    }
}

impl MessageBroker for InMemoryBroker {
    fn declare_topology<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut state = self.lock();
            Self::declare_exchange(&mut state, &topology.exchange, topology.exchange_kind)?;
            Self::declare_exchange(&mut state, &topology.dead_letter_exchange, ExchangeKind::Fanout)?;
            Self::declare_queue(&mut state, &topology.queue, None)?;
            Self::declare_queue(
                &mut state,
                &topology.dead_letter_queue,
                Some(RequeueRule {
                    target_exchange: topology.exchange.clone(),
                    ttl: topology.quarantine_ttl,
                }),
            )?;
            for key in &topology.routing_keys {
                Self::bind(&mut state, &topology.exchange, key, &topology.queue);
            }
            Self::bind(
                &mut state,
                &topology.dead_letter_exchange,
                "#",
                &topology.dead_letter_queue,
            );
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<DeliveryStream, BrokerError>> {
        Box::pin(async move {
            let (mut receiver, depth) = {
                let mut state = self.lock();
                let queue = state.queues.get_mut(&topology.queue).ok_or_else(|| {
                    BrokerError::SubscribeFailed {
                        queue: topology.queue.clone(),
                        reason: "queue not declared".to_string(),
                    }
                })?;
                let receiver =
                    queue
                        .receiver
                        .take()
                        .ok_or_else(|| BrokerError::SubscribeFailed {
                            queue: topology.queue.clone(),
                            reason: "queue already has a consumer".to_string(),
                        })?;
                (receiver, Arc::clone(&queue.depth))
            };

            let broker = Arc::clone(&self.state);
            let dead_letter_exchange = topology.dead_letter_exchange.clone();

            let stream = async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    depth.fetch_sub(1, Ordering::SeqCst);
                    let acknowledger = Box::new(InMemoryAcknowledger {
                        state: Arc::clone(&broker),
                        dead_letter_exchange: dead_letter_exchange.clone(),
                        message: message.clone(),
                    });
                    yield Ok(Delivery::new(
                        message.payload,
                        message.routing_key,
                        message.redelivered,
                        message.requeue_count,
                        acknowledger,
                    ));
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let state = self.lock();
            Self::route(
                &state,
                &self.state,
                exchange,
                &StoredMessage {
                    payload: payload.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    requeue_count: 0,
                },
            )
        })
    }
}

struct InMemoryAcknowledger {
    state: Arc<Mutex<State>>,
    dead_letter_exchange: String,
    message: StoredMessage,
}

impl Acknowledger for InMemoryAcknowledger {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move { Ok(()) })
    }

    fn dead_letter(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut message = self.message;
            message.requeue_count += 1;
            #[allow(clippy::unwrap_used)]
            let state = self.state.lock().unwrap();
            InMemoryBroker::route(&state, &self.state, &self.dead_letter_exchange, &message)
                .map_err(|e| BrokerError::SettleFailed(e.to_string()))
        })
    }
}

/// AMQP-style topic matching: `*` matches one segment, `#` matches zero or
/// more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
