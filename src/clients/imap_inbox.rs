use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

use crate::errors::SyncError;
use crate::models::inbox::{InboxMarker, InboxMessage};
use crate::service::trigger_detector::Inbox;

#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
}

/// IMAP over TLS. Every call opens its own connection; the blocking
/// `imap` client runs on the blocking pool.
pub struct ImapInbox {
    settings: ImapSettings,
}

impl ImapInbox {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Inbox for ImapInbox {
    async fn recent_from(&self, sender: &str, limit: usize) -> Result<Vec<InboxMessage>, SyncError> {
        let settings = self.settings.clone();
        let sender = sender.to_string();
        tokio::task::spawn_blocking(move || fetch_recent(&settings, &sender, limit))
            .await
            .map_err(|e| SyncError::Inbox(format!("inbox worker stopped: {}", e)))?
    }
}

fn fetch_recent(
    settings: &ImapSettings,
    sender: &str,
    limit: usize,
) -> Result<Vec<InboxMessage>, SyncError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| SyncError::Inbox(format!("tls setup failed: {}", e)))?;
    let client = imap::connect(
        (settings.host.as_str(), settings.port),
        settings.host.as_str(),
        &tls,
    )
    .map_err(|e| SyncError::Inbox(format!("connecting to {} failed: {}", settings.host, e)))?;
    let mut session = client
        .login(&settings.username, &settings.password)
        .map_err(|(e, _)| SyncError::Inbox(format!("login rejected: {}", e)))?;

    let result = (|| -> Result<Vec<InboxMessage>, SyncError> {
        session
            .select(&settings.mailbox)
            .map_err(|e| SyncError::Inbox(format!("cannot open {}: {}", settings.mailbox, e)))?;

        let mut uids: Vec<u32> = session
            .uid_search(format!("FROM {}", quote(sender)))
            .map_err(|e| SyncError::Inbox(format!("search failed: {}", e)))?
            .into_iter()
            .collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(limit.max(1));
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetched = session
            .uid_fetch(&set, "(UID INTERNALDATE RFC822)")
            .map_err(|e| SyncError::Inbox(format!("fetch failed: {}", e)))?;

        let mut messages: Vec<InboxMessage> = fetched
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let raw = fetch.body()?;
                let received = fetch.internal_date().map(|d| d.with_timezone(&Utc));
                parse_message(uid, raw, received)
            })
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(messages)
    })();

    if let Err(err) = session.logout() {
        tracing::debug!(error = %err, "imap logout failed");
    }
    result
}

/// Builds an [`InboxMessage`] from a raw RFC 822 message. Falls back to the
/// `Date:` header, then to now, when the server gave no internal date.
pub fn parse_message(uid: u32, raw: &[u8], received: Option<DateTime<Utc>>) -> Option<InboxMessage> {
    let message = MessageParser::default().parse(raw)?;
    let sender = message
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address())
        .unwrap_or_default()
        .to_string();
    let received_at = received
        .or_else(|| {
            message
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);
    let body = message
        .body_text(0)
        .map(|s| s.to_string())
        .unwrap_or_default();
    Some(InboxMessage {
        id: InboxMarker(uid),
        sender,
        received_at,
        subject: message.subject().unwrap_or_default().to_string(),
        body,
    })
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
