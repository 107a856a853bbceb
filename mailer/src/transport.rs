//! The SMTP transport behind the mail-sending processor.

use crate::letter::MailLetter;
use agora_core::BoxFuture;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Errors from mail delivery.
#[derive(Error, Debug)]
pub enum MailError {
    /// A recipient or sender address that does not parse. Retrying cannot
    /// help.
    #[error("Invalid mail address: {0}")]
    BadAddress(String),

    /// The message itself could not be assembled.
    #[error("Malformed letter: {0}")]
    Malformed(String),

    /// The SMTP relay refused or could not be reached. Usually transient.
    #[error("Mail transport failure: {0}")]
    Transport(String),
}

/// Sends one letter. Implemented by [`SmtpMailer`] in production and by
/// scripted fakes in tests.
pub trait MailTransport: Send + Sync {
    /// Deliver the letter to its recipient.
    ///
    /// # Errors
    ///
    /// [`MailError::BadAddress`] / [`MailError::Malformed`] for letters that
    /// can never be sent, [`MailError::Transport`] for relay failures.
    fn send<'a>(&'a self, letter: &'a MailLetter) -> BoxFuture<'a, Result<(), MailError>>;
}

/// SMTP relay configuration for [`SmtpMailer`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmtpConfig {
    /// Relay host name.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Relay username, if the relay requires authentication.
    pub username: Option<String>,
    /// Relay password, if the relay requires authentication.
    pub password: Option<String>,
    /// Sender address placed on every letter.
    pub sender: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            sender: "noreply@agora.local".to_string(),
        }
    }
}

/// [`MailTransport`] over lettre's async SMTP transport.
///
/// The relay connection is built lazily on first send and reused afterwards.
/// Sends are serialized through a mutex so the single relay session is never
/// used from two tasks at once.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: OnceCell<AsyncSmtpTransport<Tokio1Executor>>,
    send_lock: Mutex<()>,
}

impl SmtpMailer {
    /// Create a mailer. No connection is opened yet.
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            transport: OnceCell::const_new(),
            send_lock: Mutex::const_new(()),
        }
    }

    async fn transport(&self) -> Result<&AsyncSmtpTransport<Tokio1Executor>, MailError> {
        self.transport
            .get_or_try_init(|| async {
                tracing::info!(host = %self.config.host, port = self.config.port, "Initializing SMTP transport");
                let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
                    .map_err(|e| MailError::Transport(e.to_string()))?
                    .port(self.config.port);
                if let (Some(username), Some(password)) =
                    (&self.config.username, &self.config.password)
                {
                    builder =
                        builder.credentials(Credentials::new(username.clone(), password.clone()));
                }
                Ok(builder.build())
            })
            .await
    }
}

impl MailTransport for SmtpMailer {
    fn send<'a>(&'a self, letter: &'a MailLetter) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            let message = build_message(&self.config.sender, letter)?;
            let transport = self.transport().await?;
            let _serialized = self.send_lock.lock().await;
            transport
                .send(message)
                .await
                .map_err(|e| MailError::Transport(e.to_string()))?;
            Ok(())
        })
    }
}

fn build_message(sender: &str, letter: &MailLetter) -> Result<Message, MailError> {
    let from: Mailbox = sender
        .parse()
        .map_err(|e| MailError::BadAddress(format!("sender '{sender}': {e}")))?;
    let to: Mailbox = letter
        .address
        .parse()
        .map_err(|e| MailError::BadAddress(format!("recipient: {e}")))?;
    Message::builder()
        .from(from)
        .to(to)
        .subject(letter.subject.clone())
        .header(ContentType::TEXT_HTML)
        .body(letter.body.clone())
        .map_err(|e| MailError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn letter(address: &str) -> MailLetter {
        MailLetter {
            address: address.to_string(),
            subject: "S".to_string(),
            body: "<p>hi</p>".to_string(),
        }
    }

    #[test]
    fn valid_letter_builds_an_html_message() {
        let message = build_message("noreply@agora.local", &letter("a@b.com"));
        assert!(message.is_ok());
    }

    #[test]
    fn unparseable_recipient_is_a_bad_address() {
        let error = build_message("noreply@agora.local", &letter("not-an-address")).unwrap_err();
        assert!(matches!(error, MailError::BadAddress(_)));
    }

    #[test]
    fn unparseable_sender_is_a_bad_address() {
        let error = build_message("broken sender", &letter("a@b.com")).unwrap_err();
        assert!(matches!(error, MailError::BadAddress(_)));
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: SmtpConfig =
            serde_json::from_str(r#"{ "host": "smtp.agora.internal" }"#).unwrap();
        assert_eq!(config.host, "smtp.agora.internal");
        assert_eq!(config.port, 587);
        assert_eq!(config.sender, SmtpConfig::default().sender);
    }
}
