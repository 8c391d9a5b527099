//! Splits a roster `.ics` export into one self-contained calendar object per
//! event, the shape a CalDAV collection stores.
//!
//! Parsing goes through `ical`'s property stream rather than its component
//! tree so every event can be re-emitted with all of its original properties
//! (alarms included) untouched.

use std::io::BufReader;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::property::Property;
use uuid::Uuid;

use crate::errors::SyncError;
use crate::models::calendar::{CalendarDocument, CalendarEntry};

const CRLF: &str = "\r\n";
const MAX_LINE_OCTETS: usize = 75;
const DEFAULT_PRODID: &str = "-//rosterSync//roster export//EN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Timezone,
    Event,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct IcsCodec {
    /// Zone for DTSTART/DTEND values that carry neither `Z` nor a known TZID.
    floating_tz: Tz,
}

impl IcsCodec {
    pub fn new(floating_tz: Tz) -> Self {
        Self { floating_tz }
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<CalendarDocument, SyncError> {
        let parser = ical::PropertyParser::from_reader(BufReader::new(bytes));

        let mut stack: Vec<String> = Vec::new();
        let mut saw_calendar = false;
        let mut header: Vec<String> = Vec::new();
        let mut timezone = String::new();
        let mut events: Vec<Vec<Property>> = Vec::new();
        let mut current: Vec<Property> = Vec::new();

        for item in parser {
            let property = item.map_err(|e| SyncError::Parse(e.to_string()))?;
            let name = property.name.to_ascii_uppercase();
            let component = property
                .value
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_ascii_uppercase();

            match name.as_str() {
                "BEGIN" => {
                    if stack.is_empty() {
                        if component != "VCALENDAR" {
                            return Err(SyncError::Parse(format!(
                                "expected BEGIN:VCALENDAR, found BEGIN:{}",
                                component
                            )));
                        }
                        saw_calendar = true;
                        stack.push(component);
                        continue;
                    }
                    stack.push(component);
                    match section_of(&stack) {
                        Section::Event => current.push(property),
                        Section::Timezone => push_line(&mut timezone, &content_line(&property)),
                        Section::Header | Section::Ignored => {}
                    }
                }
                "END" => {
                    let Some(open) = stack.last() else {
                        return Err(SyncError::Parse(format!("END:{} without BEGIN", component)));
                    };
                    if *open != component {
                        return Err(SyncError::Parse(format!(
                            "END:{} does not close BEGIN:{}",
                            component, open
                        )));
                    }
                    match section_of(&stack) {
                        Section::Event => current.push(property),
                        Section::Timezone => push_line(&mut timezone, &content_line(&property)),
                        Section::Header | Section::Ignored => {}
                    }
                    stack.pop();
                    if component == "VEVENT" && stack.len() == 1 {
                        events.push(std::mem::take(&mut current));
                    }
                }
                _ => match section_of(&stack) {
                    Section::Header => header.push(content_line(&property)),
                    Section::Timezone => push_line(&mut timezone, &content_line(&property)),
                    Section::Event => current.push(property),
                    Section::Ignored => {}
                },
            }
        }

        if !saw_calendar {
            return Err(SyncError::Parse("no VCALENDAR found".to_string()));
        }
        if let Some(open) = stack.last() {
            return Err(SyncError::Parse(format!("BEGIN:{} is never closed", open)));
        }

        let timezone: Option<Arc<str>> = if timezone.is_empty() {
            None
        } else {
            Some(Arc::from(timezone))
        };
        let entries = events
            .into_iter()
            .map(|properties| self.build_entry(properties, timezone.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CalendarDocument {
            header,
            timezone,
            entries,
        })
    }

    /// A complete VCALENDAR holding only `entry` and the document's timezone
    /// definitions. `METHOD` is dropped: stored calendar objects must not
    /// carry one.
    pub fn serialize_entry(&self, document: &CalendarDocument, entry: &CalendarEntry) -> String {
        let mut out = String::new();
        push_line(&mut out, "BEGIN:VCALENDAR");
        let mut has_version = false;
        let mut has_prodid = false;
        for line in &document.header {
            let name = line
                .split([':', ';'])
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            match name.as_str() {
                "METHOD" => continue,
                "VERSION" => has_version = true,
                "PRODID" => has_prodid = true,
                _ => {}
            }
            push_line(&mut out, line);
        }
        if !has_version {
            push_line(&mut out, "VERSION:2.0");
        }
        if !has_prodid {
            push_line(&mut out, &format!("PRODID:{}", DEFAULT_PRODID));
        }
        if let Some(timezone) = &entry.timezone {
            out.push_str(timezone);
        }
        out.push_str(&entry.raw);
        push_line(&mut out, "END:VCALENDAR");
        out
    }

    fn build_entry(
        &self,
        mut properties: Vec<Property>,
        timezone: Option<Arc<str>>,
    ) -> Result<CalendarEntry, SyncError> {
        let start_prop = find(&properties, "DTSTART")
            .ok_or_else(|| SyncError::Parse("event without DTSTART".to_string()))?;
        let start = self.parse_time(start_prop)?;
        let start_is_date = is_date_value(start_prop);

        let end = match (find(&properties, "DTEND"), find(&properties, "DURATION")) {
            (Some(end_prop), _) => self.parse_time(end_prop)?,
            (None, Some(duration_prop)) => {
                let raw = duration_prop.value.as_deref().unwrap_or_default();
                parse_duration(raw)
                    .and_then(|duration| start.checked_add_signed(duration))
                    .ok_or_else(|| SyncError::Parse(format!("bad DURATION {:?}", raw)))?
            }
            (None, None) if start_is_date => start
                .checked_add_signed(Duration::days(1))
                .ok_or_else(|| SyncError::Parse("all-day event out of range".to_string()))?,
            (None, None) => start,
        };

        let summary = find(&properties, "SUMMARY")
            .and_then(|p| p.value.as_deref())
            .map(unescape_text)
            .unwrap_or_default();

        let existing_uid = find(&properties, "UID")
            .and_then(|p| p.value.as_deref())
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .map(str::to_string);
        let uid = match existing_uid {
            Some(uid) => uid,
            None => {
                let uid = synthesize_uid(&properties);
                tracing::debug!(%uid, %summary, "event has no UID, assigned one");
                properties.retain(|p| !p.name.eq_ignore_ascii_case("UID"));
                properties.insert(
                    1,
                    Property {
                        name: "UID".to_string(),
                        params: None,
                        value: Some(uid.clone()),
                    },
                );
                uid
            }
        };

        let mut raw = String::new();
        for property in &properties {
            push_line(&mut raw, &content_line(property));
        }

        Ok(CalendarEntry {
            uid,
            start,
            end,
            summary,
            timezone,
            raw,
        })
    }

    fn parse_time(&self, property: &Property) -> Result<DateTime<Utc>, SyncError> {
        let raw = property.value.as_deref().unwrap_or_default().trim();
        let tzid = param(property, "TZID");
        parse_ical_time(raw, tzid, self.floating_tz)
            .ok_or_else(|| SyncError::Parse(format!("bad {} value {:?}", property.name, raw)))
    }
}

fn section_of(stack: &[String]) -> Section {
    match stack.get(1).map(String::as_str) {
        None if stack.len() == 1 => Section::Header,
        None => Section::Ignored,
        Some("VEVENT") => Section::Event,
        Some("VTIMEZONE") => Section::Timezone,
        Some(_) => Section::Ignored,
    }
}

fn find<'a>(properties: &'a [Property], name: &str) -> Option<&'a Property> {
    properties.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

fn param<'a>(property: &'a Property, key: &str) -> Option<&'a str> {
    property
        .params
        .as_ref()?
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

fn is_date_value(property: &Property) -> bool {
    param(property, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || property.value.as_deref().is_some_and(|v| v.trim().len() == 8)
}

/// `20251013T080000Z`, `20251013T080000` (in `tzid` or the floating zone) or
/// the date form `20251013` (midnight local).
pub fn parse_ical_time(raw: &str, tzid: Option<&str>, floating_tz: Tz) -> Option<DateTime<Utc>> {
    if let Some(utc) = raw.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&naive));
    }
    let naive = if raw.len() == 8 {
        NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?.and_hms_opt(0, 0, 0)?
    } else {
        NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S").ok()?
    };
    let zone = match tzid {
        Some(name) => name.trim_matches('"').parse::<Tz>().unwrap_or_else(|_| {
            tracing::debug!(tzid = name, "unknown TZID, using floating zone");
            floating_tz
        }),
        None => floating_tz,
    };
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// RFC 5545 durations: `P1W`, `P1D`, `PT8H30M`, `-PT15M`.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (negative, rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let rest = rest.strip_prefix('P')?;
    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for ch in rest.chars() {
        match ch {
            'T' => in_time = true,
            '0'..='9' => number.push(ch),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                let part = match (unit, in_time) {
                    ('W', false) => Duration::try_weeks(n),
                    ('D', false) => Duration::try_days(n),
                    ('H', true) => Duration::try_hours(n),
                    ('M', true) => Duration::try_minutes(n),
                    ('S', true) => Duration::try_seconds(n),
                    _ => None,
                }?;
                total = total.checked_add(&part)?;
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(if negative { -total } else { total })
}

fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Stable across runs for the same event content, so re-publishing an
/// unchanged export replaces rather than duplicates.
fn synthesize_uid(properties: &[Property]) -> String {
    let value_of = |name: &str| {
        find(properties, name)
            .and_then(|p| p.value.clone())
            .unwrap_or_default()
    };
    let key = format!(
        "{}|{}|{}|{}",
        value_of("DTSTART"),
        value_of("DTEND"),
        value_of("SUMMARY"),
        value_of("LOCATION")
    );
    format!("{}@rostersync", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

fn content_line(property: &Property) -> String {
    let mut line = property.name.clone();
    if let Some(params) = &property.params {
        for (key, values) in params {
            line.push(';');
            line.push_str(key);
            line.push('=');
            let rendered: Vec<String> = values.iter().map(|v| quote_param(v)).collect();
            line.push_str(&rendered.join(","));
        }
    }
    line.push(':');
    if let Some(value) = &property.value {
        line.push_str(value);
    }
    line
}

fn quote_param(value: &str) -> String {
    let needs_quotes = value.contains([':', ';', ',']) && !value.starts_with('"');
    if needs_quotes {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

/// Appends `line` folded at 75 octets, terminated by CRLF.
fn push_line(out: &mut String, line: &str) {
    let mut budget = MAX_LINE_OCTETS;
    let mut used = 0;
    for ch in line.chars() {
        let width = ch.len_utf8();
        if used + width > budget {
            out.push_str(CRLF);
            out.push(' ');
            budget = MAX_LINE_OCTETS - 1;
            used = 0;
        }
        out.push(ch);
        used += width;
    }
    out.push_str(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//ROI Online//Rooster//NL\r\n\
METHOD:PUBLISH\r\n\
BEGIN:VTIMEZONE\r\n\
TZID:Europe/Amsterdam\r\n\
BEGIN:DAYLIGHT\r\n\
TZOFFSETFROM:+0100\r\n\
TZOFFSETTO:+0200\r\n\
DTSTART:19700329T020000\r\n\
END:DAYLIGHT\r\n\
END:VTIMEZONE\r\n\
BEGIN:VEVENT\r\n\
UID:shift-1001@roi\r\n\
DTSTART;TZID=Europe/Amsterdam:20251013T080000\r\n\
DTEND;TZID=Europe/Amsterdam:20251013T163000\r\n\
SUMMARY:Dienst Afdeling 3\\, vroeg\r\n\
BEGIN:VALARM\r\n\
ACTION:DISPLAY\r\n\
TRIGGER:-PT30M\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
DTSTART:20251014T120000Z\r\n\
DURATION:PT8H\r\n\
SUMMARY:Late dienst\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    fn codec() -> IcsCodec {
        IcsCodec::new(chrono_tz::Europe::Amsterdam)
    }

    #[test]
    fn splits_events_and_shares_timezone() {
        let doc = codec().parse(ROSTER.as_bytes()).unwrap();
        assert_eq!(doc.len(), 2);
        let first = &doc.entries[0];
        assert_eq!(first.uid, "shift-1001@roi");
        assert_eq!(first.summary, "Dienst Afdeling 3, vroeg");
        assert_eq!(first.start, Utc.with_ymd_and_hms(2025, 10, 13, 6, 0, 0).unwrap());
        assert_eq!(first.end, Utc.with_ymd_and_hms(2025, 10, 13, 14, 30, 0).unwrap());
        assert!(first.raw.contains("BEGIN:VALARM"));
        let tz = doc.timezone.as_ref().unwrap();
        assert!(tz.starts_with("BEGIN:VTIMEZONE"));
        assert!(Arc::ptr_eq(first.timezone.as_ref().unwrap(), tz));
    }

    #[test]
    fn missing_uid_is_synthesized_deterministically() {
        let first = codec().parse(ROSTER.as_bytes()).unwrap();
        let second = codec().parse(ROSTER.as_bytes()).unwrap();
        let entry = &first.entries[1];
        assert!(entry.uid.ends_with("@rostersync"));
        assert_eq!(entry.uid, second.entries[1].uid);
        assert!(entry.raw.contains(&format!("UID:{}", entry.uid)));
        assert_eq!(entry.end, entry.start + Duration::hours(8));
    }

    #[test]
    fn serialized_entry_stands_alone() {
        let codec = codec();
        let doc = codec.parse(ROSTER.as_bytes()).unwrap();
        let single = codec.serialize_entry(&doc, &doc.entries[0]);
        assert!(single.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(single.ends_with("END:VCALENDAR\r\n"));
        assert!(single.contains("BEGIN:VTIMEZONE"));
        assert!(!single.contains("METHOD:"));
        assert_eq!(single.matches("BEGIN:VEVENT").count(), 1);

        let reparsed = codec.parse(single.as_bytes()).unwrap();
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed.entries[0].uid, "shift-1001@roi");
        assert_eq!(reparsed.entries[0].start, doc.entries[0].start);
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        let unterminated = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nDTSTART:20251013T080000Z\r\nEND:VCALENDAR\r\n";
        assert!(matches!(codec().parse(unterminated.as_bytes()), Err(SyncError::Parse(_))));

        let no_start = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:x\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(matches!(codec().parse(no_start.as_bytes()), Err(SyncError::Parse(_))));

        assert!(matches!(codec().parse(b"VERSION:2.0\r\n"), Err(SyncError::Parse(_))));
    }

    #[test]
    fn oversized_durations_are_parse_errors() {
        for duration in ["P99999999W", "P99999999999999W", "PT9223372036854775807S"] {
            let ics = format!(
                "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\nDTSTART:20251013T080000Z\r\nDURATION:{}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
                duration
            );
            match codec().parse(ics.as_bytes()) {
                Err(SyncError::Parse(message)) => assert!(message.contains("DURATION"), "{}", message),
                other => panic!("{} gave {:?}", duration, other.map(|d| d.len())),
            }
        }
        assert_eq!(parse_duration("P99999999999999W"), None);
        assert_eq!(parse_duration("P1W6D"), Some(Duration::days(13)));
    }

    #[test]
    fn time_forms() {
        let tz = chrono_tz::Europe::Amsterdam;
        assert_eq!(
            parse_ical_time("20250115T090000", None, tz),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap())
        );
        assert_eq!(
            parse_ical_time("20250115", Some("America/New_York"), tz),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 5, 0, 0).unwrap())
        );
        assert_eq!(parse_ical_time("2025-01-15", None, tz), None);
    }

    #[test]
    fn long_lines_are_folded() {
        let mut out = String::new();
        let line = format!("SUMMARY:{}", "x".repeat(200));
        push_line(&mut out, &line);
        assert!(out.split(CRLF).all(|l| l.len() <= MAX_LINE_OCTETS));
        assert_eq!(out.replace("\r\n ", ""), format!("{}\r\n", line));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("PT8H30M"), Some(Duration::minutes(510)));
        assert_eq!(parse_duration("P1W"), Some(Duration::weeks(1)));
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("8H"), None);
    }
}
