//! The lapin-backed [`MessageBroker`] implementation.

use crate::config::AmqpConfig;
use agora_core::{
    Acknowledger, BoxFuture, BrokerError, Delivery, DeliveryStream, ExchangeKind, MessageBroker,
    QueueTopology,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::OnceCell;

/// AMQP broker backed by a lazily-opened shared connection.
///
/// Cheap to share behind an `Arc`; every consumer in the process uses the same
/// handle. The long-lived connection is opened on the first subscribe or
/// publish. If it later dies the delivery streams end with a transport error
/// and the process is expected to restart; unacknowledged messages return to
/// their queues, so nothing is lost.
pub struct AmqpBroker {
    config: AmqpConfig,
    connection: OnceCell<Connection>,
}

impl AmqpBroker {
    /// Create a broker handle. No connection is opened yet.
    #[must_use]
    pub const fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: OnceCell::const_new(),
        }
    }

    fn connection_properties(&self) -> ConnectionProperties {
        ConnectionProperties::default().with_connection_name(self.config.connection_name.as_str().into())
    }

    /// The shared long-lived connection, opened exactly once even under
    /// concurrent first use. A failed open leaves the cell empty, so the next
    /// caller retries.
    async fn shared_connection(&self) -> Result<&Connection, BrokerError> {
        self.connection
            .get_or_try_init(|| async {
                tracing::info!(
                    connection_name = %self.config.connection_name,
                    "Opening shared AMQP connection"
                );
                Connection::connect(&self.config.uri, self.connection_properties()).await
            })
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))
    }
}

impl MessageBroker for AmqpBroker {
    fn declare_topology<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            // Administrative connection, closed as soon as the schema work is
            // done.
            let connection = Connection::connect(&self.config.uri, self.connection_properties())
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

            channel
                .exchange_declare(
                    &topology.exchange,
                    exchange_kind(topology.exchange_kind),
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| declare_error(&topology.exchange, &e))?;

            // The dead-letter exchange is always fanout: everything rejected
            // off the primary queue funnels into the one quarantine queue.
            channel
                .exchange_declare(
                    &topology.dead_letter_exchange,
                    lapin::ExchangeKind::Fanout,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| declare_error(&topology.dead_letter_exchange, &e))?;

            channel
                .queue_declare(
                    &topology.queue,
                    durable_queue(),
                    primary_queue_arguments(topology),
                )
                .await
                .map_err(|e| declare_error(&topology.queue, &e))?;

            for routing_key in &topology.routing_keys {
                channel
                    .queue_bind(
                        &topology.queue,
                        &topology.exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| declare_error(&topology.queue, &e))?;
            }

            channel
                .queue_declare(
                    &topology.dead_letter_queue,
                    durable_queue(),
                    quarantine_arguments(topology),
                )
                .await
                .map_err(|e| declare_error(&topology.dead_letter_queue, &e))?;

            channel
                .queue_bind(
                    &topology.dead_letter_queue,
                    &topology.dead_letter_exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| declare_error(&topology.dead_letter_queue, &e))?;

            tracing::info!(
                exchange = %topology.exchange,
                queue = %topology.queue,
                dead_letter_queue = %topology.dead_letter_queue,
                quarantine_ttl_ms = quarantine_ttl_millis(topology),
                "Topology declared"
            );

            if let Err(e) = connection.close(200, "topology declared").await {
                tracing::debug!(error = %e, "Error closing administrative connection");
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topology: &'a QueueTopology,
    ) -> BoxFuture<'a, Result<DeliveryStream, BrokerError>> {
        Box::pin(async move {
            let connection = self.shared_connection().await?;
            let channel = connection.create_channel().await.map_err(|e| {
                BrokerError::SubscribeFailed {
                    queue: topology.queue.clone(),
                    reason: e.to_string(),
                }
            })?;

            // Prefetch bounds how many unacknowledged deliveries the broker
            // pushes at us; 1 for sequential queues preserves delivery order.
            let prefetch =
                u16::try_from(topology.processing_order.max_in_flight()).unwrap_or(u16::MAX);
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::SubscribeFailed {
                    queue: topology.queue.clone(),
                    reason: e.to_string(),
                })?;

            let consumer = channel
                .basic_consume(
                    &topology.queue,
                    &format!("{}-consumer", topology.queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::SubscribeFailed {
                    queue: topology.queue.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(
                queue = %topology.queue,
                prefetch,
                "AMQP subscription established"
            );

            // The channel moves into the stream so it outlives this call.
            let stream = consumer.map(move |result| {
                let _keep_alive = &channel;
                match result {
                    Ok(delivery) => Ok(map_delivery(delivery)),
                    Err(e) => Err(BrokerError::Transport(e.to_string())),
                }
            });
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
            let publish_error = |e: lapin::Error| BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: e.to_string(),
            };

            let connection = self.shared_connection().await?;
            let channel = connection.create_channel().await.map_err(publish_error)?;
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default(),
                )
                .await
                .map_err(publish_error)?
                .await
                .map_err(publish_error)?;
            Ok(())
        })
    }
}

/// Settles one AMQP delivery.
struct AmqpAcknowledger {
    acker: lapin::acker::Acker,
}

impl Acknowledger for AmqpAcknowledger {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::SettleFailed(e.to_string()))
        })
    }

    fn dead_letter(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            // requeue=false hands the message to the queue's dead-letter
            // exchange instead of putting it back at the head of the queue.
            self.acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await
                .map_err(|e| BrokerError::SettleFailed(e.to_string()))
        })
    }
}

fn map_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let requeue_count = death_count(delivery.properties.headers());
    Delivery::new(
        delivery.data,
        delivery.routing_key.to_string(),
        delivery.redelivered,
        requeue_count,
        Box::new(AmqpAcknowledger {
            acker: delivery.acker,
        }),
    )
}

const fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// Arguments for the primary queue: rejected messages route to the
/// dead-letter exchange.
fn primary_queue_arguments(topology: &QueueTopology) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(topology.dead_letter_exchange.as_str().into()),
    );
    arguments
}

/// Arguments for the dead-letter queue: the back-reference to the primary
/// exchange plus the quarantine TTL. Together they make the broker requeue
/// quarantined messages without any consumer on the queue.
fn quarantine_arguments(topology: &QueueTopology) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(topology.exchange.as_str().into()),
    );
    arguments.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(quarantine_ttl_millis(topology)),
    );
    arguments
}

fn quarantine_ttl_millis(topology: &QueueTopology) -> i64 {
    i64::try_from(topology.quarantine_ttl.as_millis()).unwrap_or(i64::MAX)
}

fn declare_error(name: &str, error: &lapin::Error) -> BrokerError {
    classify_declare_failure(name, &error.to_string())
}

/// A declaration failure is a schema conflict when the broker reports a
/// precondition failure, and a connectivity problem otherwise.
fn classify_declare_failure(name: &str, reason: &str) -> BrokerError {
    if reason.contains("PRECONDITION") {
        BrokerError::TopologyConflict {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    } else {
        BrokerError::ConnectionFailed(reason.to_string())
    }
}

/// Number of dead-letter cycles recorded in the `x-death` header.
///
/// The broker appends one entry per (queue, reason) pair with a running
/// count; the largest count is how many times this message has been through
/// quarantine.
fn death_count(headers: &Option<FieldTable>) -> u64 {
    let Some(headers) = headers else {
        return 0;
    };
    let Some(deaths) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
        .map(|(_, value)| value)
    else {
        return 0;
    };
    let AMQPValue::FieldArray(deaths) = deaths else {
        return 0;
    };
    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(death) => death
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "count")
                .and_then(|(_, value)| match value {
                    AMQPValue::LongLongInt(count) => u64::try_from(*count).ok(),
                    AMQPValue::LongInt(count) => u64::try_from(*count).ok(),
                    _ => None,
                }),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use agora_core::ProcessingOrder;
    use std::time::Duration;

    fn topology() -> QueueTopology {
        QueueTopology::builder("agora.events", "agora.search.indexing")
            .quarantine_ttl(Duration::from_secs(60))
            .processing_order(ProcessingOrder::Sequential)
            .build()
    }

    fn header(table: &FieldTable, key: &str) -> Option<AMQPValue> {
        table
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.clone())
    }

    #[test]
    fn primary_queue_routes_rejections_to_the_dead_letter_exchange() {
        let arguments = primary_queue_arguments(&topology());
        assert_eq!(
            header(&arguments, "x-dead-letter-exchange"),
            Some(AMQPValue::LongString("agora.events.dead".into()))
        );
        assert_eq!(header(&arguments, "x-message-ttl"), None);
    }

    #[test]
    fn quarantine_queue_points_back_at_the_primary_exchange_with_a_ttl() {
        let arguments = quarantine_arguments(&topology());
        assert_eq!(
            header(&arguments, "x-dead-letter-exchange"),
            Some(AMQPValue::LongString("agora.events".into()))
        );
        assert_eq!(
            header(&arguments, "x-message-ttl"),
            Some(AMQPValue::LongLongInt(60_000))
        );
    }

    #[test]
    fn death_count_reads_the_largest_recorded_count() {
        let mut death = FieldTable::default();
        death.insert("count".into(), AMQPValue::LongLongInt(3));
        death.insert("queue".into(), AMQPValue::LongString("agora.events.dead-dlq".into()));
        let mut other = FieldTable::default();
        other.insert("count".into(), AMQPValue::LongLongInt(1));

        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(
                vec![AMQPValue::FieldTable(death), AMQPValue::FieldTable(other)].into(),
            ),
        );

        assert_eq!(death_count(&Some(headers)), 3);
        assert_eq!(death_count(&None), 0);
        assert_eq!(death_count(&Some(FieldTable::default())), 0);
    }

    #[test]
    fn precondition_failures_map_to_topology_conflicts() {
        let err = classify_declare_failure(
            "agora.events.dead-dlq",
            "PRECONDITION_FAILED - inequivalent arg 'x-message-ttl' for queue 'agora.events.dead-dlq'",
        );
        assert!(matches!(
            err,
            BrokerError::TopologyConflict { name, .. } if name == "agora.events.dead-dlq"
        ));
    }

    #[test]
    fn other_declaration_failures_map_to_connection_errors() {
        let error = lapin::Error::InvalidChannelState(lapin::ChannelState::Error);
        assert!(matches!(
            declare_error("agora.events", &error),
            BrokerError::ConnectionFailed(_)
        ));
    }

    #[test]
    fn broker_handle_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AmqpBroker>();
    }
}
