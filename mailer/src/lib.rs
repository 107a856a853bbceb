//! # Agora Mailer
//!
//! The mail-sending side of the event pipeline. Letters arrive on their own
//! queue already rendered; this crate only delivers them over SMTP.
//!
//! Delivery is fire-and-forget with at-least-once semantics: a retry after a
//! partial success can send a duplicate mail. That trade is accepted; the
//! alternative (exactly-once) would require a delivery record this pipeline
//! deliberately does not keep.

pub mod letter;
pub mod pipeline;
pub mod processor;
pub mod transport;

pub use letter::MailLetter;
pub use pipeline::mail_topology;
pub use processor::MailSendingProcessor;
pub use transport::{MailError, MailTransport, SmtpConfig, SmtpMailer};
