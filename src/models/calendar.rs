use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use crate::errors::SyncError;

/// One VEVENT of a roster document.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub uid: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: String,
    /// VTIMEZONE block(s) of the source document, shared by all its entries.
    pub timezone: Option<Arc<str>>,
    /// The serialized `BEGIN:VEVENT` .. `END:VEVENT` block.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarDocument {
    /// Top level VCALENDAR content lines (VERSION, PRODID, ...), unfolded.
    pub header: Vec<String>,
    pub timezone: Option<Arc<str>>,
    pub entries: Vec<CalendarEntry>,
}

impl CalendarDocument {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entries starting strictly before `cutoff` are purged from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub cutoff: DateTime<Utc>,
}

impl RetentionWindow {
    pub fn days_before(now: DateTime<Utc>, days: u32) -> Result<Self, SyncError> {
        if days == 0 {
            return Err(SyncError::Validation(
                "retention must keep at least one day".to_string(),
            ));
        }
        let cutoff = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| SyncError::Validation(format!("retention of {} days underflows", days)))?;
        Ok(Self { cutoff })
    }

    pub fn is_expired(&self, start: DateTime<Utc>) -> bool {
        start < self.cutoff
    }
}

/// An entry as listed by the calendar store's range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub uid: String,
    /// Store specific address of the entry, used to delete it.
    pub href: String,
    pub start: DateTime<Utc>,
}
