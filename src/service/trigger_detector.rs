//! Decides whether the inbox holds a roster notification we have not acted
//! on yet.
//!
//! The detector is a pure function: the caller supplies the messages and the
//! marker from the previous run and persists the marker it gets back. A
//! missing marker means we do not know what was already handled, so the call
//! only records the newest message and never reports a trigger.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::SyncError;
use crate::models::inbox::{InboxMarker, InboxMessage};
use crate::models::period::Period;

pub const DEFAULT_SCAN_LIMIT: usize = 10;

/// Source of inbox messages. Implementations return at most `limit`
/// messages from `sender`, newest first when they can.
#[async_trait]
pub trait Inbox: Send + Sync {
    async fn recent_from(&self, sender: &str, limit: usize) -> Result<Vec<InboxMessage>, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerResult {
    pub found: bool,
    /// Week named in the notification. `None` with `found == true` means the
    /// trigger is real but the body did not name a usable week.
    pub target_period: Option<Period>,
    pub new_marker: Option<InboxMarker>,
}

impl TriggerResult {
    fn quiet(new_marker: Option<InboxMarker>) -> Self {
        Self {
            found: false,
            target_period: None,
            new_marker,
        }
    }
}

pub fn detect(
    messages: &[InboxMessage],
    filter_sender: &str,
    last_marker: Option<InboxMarker>,
    scan_limit: usize,
) -> TriggerResult {
    let wanted = normalize_address(filter_sender);
    let mut matching: Vec<&InboxMessage> = messages
        .iter()
        .filter(|message| normalize_address(&message.sender) == wanted)
        .collect();
    matching.sort_by(|a, b| b.id.cmp(&a.id));
    matching.truncate(scan_limit.max(1));

    let Some(newest) = matching.first() else {
        return TriggerResult::quiet(last_marker);
    };

    let Some(last) = last_marker else {
        tracing::info!(marker = %newest.id, "no marker yet, recording newest notification without acting");
        return TriggerResult::quiet(Some(newest.id));
    };

    if newest.id <= last {
        return TriggerResult::quiet(Some(last));
    }

    let skipped = matching.iter().filter(|m| m.id > last).count() - 1;
    if skipped > 0 {
        tracing::info!(skipped, "several new notifications, only the newest is used");
    }

    let target_period = extract_period(&newest.body, newest.received_at);
    if target_period.is_none() {
        tracing::warn!(marker = %newest.id, "notification names no usable week");
    }
    TriggerResult {
        found: true,
        target_period,
        new_marker: Some(newest.id),
    }
}

/// Reads a week number from free text such as "rooster voor week 43 staat
/// klaar" or "Schedule 2025 week 43". Without an explicit year the week is
/// placed in the year that puts it closest to `received_at`.
pub fn extract_period(body: &str, received_at: DateTime<Utc>) -> Option<Period> {
    static YEAR_FIRST: OnceLock<Regex> = OnceLock::new();
    static WEEK_FIRST: OnceLock<Regex> = OnceLock::new();
    let year_first = YEAR_FIRST.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{4})\s*[-,]?\s*(?:week|wk)\.?\s*(?:nr\.?|nummer|number|no\.?)?\s*(\d{1,2})\b")
            .expect("static regex")
    });
    let week_first = WEEK_FIRST.get_or_init(|| {
        Regex::new(r"(?i)\b(?:week|wk)\.?\s*(?:nr\.?|nummer|number|no\.?)?\s*(\d{1,2})\b(?:\s*[,/-]?\s*(\d{4})\b)?")
            .expect("static regex")
    });

    if let Some(caps) = year_first.captures(body) {
        let year = caps[1].parse::<i32>().ok()?;
        let week = caps[2].parse::<u32>().ok()?;
        return Period::new(year, week).ok();
    }

    let caps = week_first.captures(body)?;
    let week = caps[1].parse::<u32>().ok()?;
    if let Some(year) = caps.get(2) {
        let year = year.as_str().parse::<i32>().ok()?;
        return Period::new(year, week).ok();
    }
    nearest_period(week, received_at)
}

fn nearest_period(week: u32, received_at: DateTime<Utc>) -> Option<Period> {
    let received = received_at.date_naive();
    let base = Period::containing(received).year();
    [base - 1, base, base + 1]
        .into_iter()
        .filter_map(|year| Period::new(year, week).ok())
        .filter_map(|period| period.monday().map(|monday| (period, (monday - received).num_days().abs())))
        .min_by_key(|(_, distance)| *distance)
        .map(|(period, _)| period)
}

/// `"Roster <NoReply@Staff.nl>"` -> `"noreply@staff.nl"`
fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let address = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    address.trim().to_ascii_lowercase()
}
