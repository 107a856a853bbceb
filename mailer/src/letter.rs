//! The letter payload carried on the mail queue.

use serde::{Deserialize, Serialize};

/// One rendered mail, ready to send.
///
/// Rendering happens in the producing service; the queue owns the letter
/// until it is delivered, then it is discarded. No delivery record is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailLetter {
    /// Recipient address.
    pub address: String,
    /// Subject line.
    pub subject: String,
    /// Rendered HTML body.
    pub body: String,
}
