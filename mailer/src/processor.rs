//! The mail-sending processor.

use crate::letter::MailLetter;
use crate::transport::{MailError, MailTransport};
use agora_core::{ProcessFuture, ProcessingError, Processor};
use std::sync::Arc;

impl From<MailError> for ProcessingError {
    fn from(error: MailError) -> Self {
        match error {
            MailError::BadAddress(_) | MailError::Malformed(_) => Self::Permanent(error.to_string()),
            MailError::Transport(_) => Self::Transient(error.to_string()),
        }
    }
}

/// Sends letters from the mail queue through a [`MailTransport`].
pub struct MailSendingProcessor {
    transport: Arc<dyn MailTransport>,
}

impl MailSendingProcessor {
    /// Create a processor over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }
}

impl Processor<MailLetter> for MailSendingProcessor {
    fn process<'a>(&'a self, letter: &'a MailLetter) -> ProcessFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                recipient = %obfuscate(&letter.address),
                subject = %letter.subject,
                "Sending mail"
            );
            self.transport.send(letter).await?;
            Ok(())
        })
    }
}

/// Recipient addresses are personal data; log lines keep only the first
/// character of the local part.
fn obfuscate(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}
