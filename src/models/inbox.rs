use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position in the inbox of the last examined trigger message. Wraps the
/// IMAP UID, which only grows within a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxMarker(pub u32);

impl fmt::Display for InboxMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    pub id: InboxMarker,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub subject: String,
    pub body: String,
}
