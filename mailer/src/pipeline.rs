//! Queue wiring for the mail-sending pipeline.

use agora_core::{ExchangeKind, ProcessingOrder, QueueTopology};

/// Topology of the mail-sending queue.
///
/// Fanout exchange: every letter published to it reaches the sender queue
/// regardless of routing key. Undeliverable letters quarantine on
/// `agora.mail.unsent-dlq` until their TTL returns them for another cycle.
#[must_use]
pub fn mail_topology() -> QueueTopology {
    QueueTopology::builder("agora.mail.sending", "agora.mail.sender")
        .exchange_kind(ExchangeKind::Fanout)
        .dead_letter_exchange("agora.mail.unsent")
        .processing_order(ProcessingOrder::Sequential)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mail_queue_is_fanout_and_sequential() {
        let topology = mail_topology();
        assert_eq!(topology.exchange_kind, ExchangeKind::Fanout);
        assert_eq!(topology.queue, "agora.mail.sender");
        assert_eq!(topology.dead_letter_exchange, "agora.mail.unsent");
        assert_eq!(topology.dead_letter_queue, "agora.mail.unsent-dlq");
        assert_eq!(topology.processing_order, ProcessingOrder::Sequential);
    }
}
