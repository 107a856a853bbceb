//! Mail queue end-to-end tests against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use agora_core::{BoxFuture, MessageBroker, Processor};
use agora_mailer::{MailError, MailLetter, MailSendingProcessor, MailTransport, mail_topology};
use agora_runtime::QueueConsumer;
use agora_testing::InMemoryBroker;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct FlakyTransport {
    failures: usize,
    sends: AtomicUsize,
}

impl FlakyTransport {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            sends: AtomicUsize::new(0),
        }
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl MailTransport for FlakyTransport {
    fn send<'a>(&'a self, _letter: &'a MailLetter) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            let attempt = self.sends.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(MailError::Transport("relay refused connection".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not met within the virtual deadline");
}

fn letter_bytes() -> Vec<u8> {
    serde_json::to_vec(&MailLetter {
        address: "a@b.com".to_string(),
        subject: "S".to_string(),
        body: "<p>hi</p>".to_string(),
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn letter_is_delivered_after_two_transport_failures() {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&mail_topology()).await.unwrap();

    let transport = Arc::new(FlakyTransport::new(2));
    let processor: Arc<dyn Processor<MailLetter>> =
        Arc::new(MailSendingProcessor::new(transport.clone()));
    let broker_dyn: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let (mut consumer, shutdown) = QueueConsumer::new(broker_dyn, mail_topology(), processor);
    let handle = tokio::spawn(async move { consumer.start().await });

    broker
        .publish("agora.mail.sending", "", &letter_bytes())
        .await
        .unwrap();

    // Two failed sends, two backoff waits, then one successful send.
    wait_until(|| transport.sends() == 3).await;
    assert_eq!(broker.queue_depth("agora.mail.unsent-dlq"), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn undeliverable_letter_quarantines_on_the_unsent_queue() {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&mail_topology()).await.unwrap();

    let transport = Arc::new(FlakyTransport::new(usize::MAX));
    let processor: Arc<dyn Processor<MailLetter>> =
        Arc::new(MailSendingProcessor::new(transport.clone()));
    let broker_dyn: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let (mut consumer, shutdown) = QueueConsumer::new(broker_dyn, mail_topology(), processor);
    let handle = tokio::spawn(async move { consumer.start().await });

    broker
        .publish("agora.mail.sending", "", &letter_bytes())
        .await
        .unwrap();

    wait_until(|| broker.queue_depth("agora.mail.unsent-dlq") == 1).await;
    // Initial attempt plus the full retry budget, never acknowledged.
    assert_eq!(transport.sends(), 6);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
