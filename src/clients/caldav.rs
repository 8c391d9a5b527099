//! CalDAV calendar store over reqwest.
//!
//! - PROPFIND to find the target calendar (by display name, falling back to
//!   the first calendar the account owns)
//! - PUT `<calendar>/<uid>.ics` for upserts
//! - REPORT calendar-query with a time range for retention cleanup
//! - DELETE by href

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Method, StatusCode, Url};

use crate::errors::SyncError;
use crate::models::calendar::RemoteEntry;
use crate::service::calendar_publisher::{CalendarSession, CalendarStore};
use crate::service::ics_codec::IcsCodec;

const DISCOVERY_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Clone)]
pub struct CalDavSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub calendar_name: String,
    /// Skips discovery when set.
    pub calendar_url: Option<String>,
    /// Zone for floating times in documents read back from the server.
    pub floating_tz: Tz,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarInfo {
    pub url: String,
    pub display_name: Option<String>,
}

pub struct CalDavStore {
    http: reqwest::Client,
    settings: CalDavSettings,
}

impl CalDavStore {
    pub fn new(settings: CalDavSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Calendars visible under the configured principal URL.
    pub async fn list_calendars(&self) -> Result<Vec<CalendarInfo>, SyncError> {
        let base = parse_url(&self.settings.url)?;
        let response = self
            .http
            .request(dav_method("PROPFIND")?, base.clone())
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header("Depth", "1")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"))
            .body(DISCOVERY_BODY)
            .send()
            .await?;
        let body = check(response, "PROPFIND").await?;
        parse_multistatus(&body)?
            .into_iter()
            .filter(|r| r.is_calendar)
            .map(|r| {
                Ok(CalendarInfo {
                    url: resolve(&base, &r.href)?.to_string(),
                    display_name: r.display_name,
                })
            })
            .collect()
    }

    async fn locate_calendar(&self) -> Result<Url, SyncError> {
        if let Some(url) = &self.settings.calendar_url {
            return Ok(with_trailing_slash(parse_url(url)?));
        }
        let calendars = self.list_calendars().await?;
        let wanted = self.settings.calendar_name.as_str();
        if let Some(found) = calendars
            .iter()
            .find(|c| c.display_name.as_deref() == Some(wanted))
        {
            return Ok(with_trailing_slash(parse_url(&found.url)?));
        }
        let Some(first) = calendars.first() else {
            return Err(SyncError::Remote(format!(
                "no calendars under {}",
                self.settings.url
            )));
        };
        tracing::warn!(
            wanted,
            using = ?first.display_name,
            "calendar not found by name, using the first one"
        );
        Ok(with_trailing_slash(parse_url(&first.url)?))
    }
}

#[async_trait]
impl CalendarStore for CalDavStore {
    type Session = CalDavSession;

    async fn connect(&self) -> Result<CalDavSession, SyncError> {
        let calendar = self.locate_calendar().await?;
        tracing::info!(calendar = %calendar, "connected to calendar");
        Ok(CalDavSession {
            http: self.http.clone(),
            calendar,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            codec: IcsCodec::new(self.settings.floating_tz),
        })
    }
}

#[derive(Clone)]
pub struct CalDavSession {
    http: reqwest::Client,
    calendar: Url,
    username: String,
    password: String,
    codec: IcsCodec,
}

impl CalDavSession {
    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn entry_from_report(&self, href: &str, data: &str) -> Option<RemoteEntry> {
        let document = match self.codec.parse(data.as_bytes()) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(href, error = %err, "skipping unreadable calendar object");
                return None;
            }
        };
        let entry = document.entries.into_iter().next()?;
        Some(RemoteEntry {
            uid: entry.uid,
            href: href.to_string(),
            start: entry.start,
        })
    }
}

#[async_trait]
impl CalendarSession for CalDavSession {
    async fn upsert(&self, uid: &str, document: &str) -> Result<(), SyncError> {
        let url = object_url(&self.calendar, uid)?;
        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/calendar; charset=utf-8"))
            .body(document.to_string())
            .send()
            .await?;
        check(response, "PUT").await.map(|_| ())
    }

    async fn query_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RemoteEntry>, SyncError> {
        let response = self
            .request(dav_method("REPORT")?, self.calendar.clone())
            .header("Depth", "1")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"))
            .body(report_body(cutoff))
            .send()
            .await?;
        let body = check(response, "REPORT").await?;
        Ok(parse_multistatus(&body)?
            .into_iter()
            .filter_map(|r| {
                let data = r.calendar_data.as_deref()?;
                self.entry_from_report(&r.href, data)
            })
            .collect())
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), SyncError> {
        let url = resolve(&self.calendar, &entry.href)?;
        let response = self.request(Method::DELETE, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, "DELETE").await.map(|_| ())
    }
}

fn report_body(cutoff: DateTime<Utc>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:time-range start="19700101T000000Z" end="{}"/>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#,
        cutoff.format("%Y%m%dT%H%M%SZ")
    )
}

/// `{calendar}/{uid}.ics` with the uid percent-encoded as one path segment,
/// so distinct uids never share an object.
fn object_url(calendar: &Url, uid: &str) -> Result<Url, SyncError> {
    let mut url = calendar.clone();
    url.path_segments_mut()
        .map_err(|_| SyncError::Config(format!("calendar url {} cannot hold objects", calendar)))?
        .pop_if_empty()
        .push(&format!("{}.ics", uid));
    Ok(url)
}

fn dav_method(name: &str) -> Result<Method, SyncError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| SyncError::Validation(format!("bad method {}: {}", name, e)))
}

fn parse_url(raw: &str) -> Result<Url, SyncError> {
    Url::parse(raw).map_err(|e| SyncError::Config(format!("invalid url {}: {}", raw, e)))
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn resolve(base: &Url, href: &str) -> Result<Url, SyncError> {
    base.join(href)
        .map_err(|e| SyncError::Remote(format!("bad href {}: {}", href, e)))
}

async fn check(response: reqwest::Response, what: &str) -> Result<String, SyncError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let detail = format!("{} returned {}", what, status);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Authorization(detail),
        s if s.is_server_error() => SyncError::Connection(detail),
        _ => SyncError::Remote(detail),
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DavResponse {
    href: String,
    display_name: Option<String>,
    is_calendar: bool,
    calendar_data: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    Href,
    DisplayName,
    CalendarData,
}

fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>, SyncError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut capture = Capture::None;
    let mut in_resourcetype = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                match e.local_name().as_ref() {
                    b"response" => current = Some(DavResponse::default()),
                    b"href" if capture == Capture::None => capture = Capture::Href,
                    b"displayname" => capture = Capture::DisplayName,
                    b"calendar-data" => capture = Capture::CalendarData,
                    b"resourcetype" => in_resourcetype = true,
                    b"calendar" if in_resourcetype => mark_calendar(&mut current),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if in_resourcetype && e.local_name().as_ref() == b"calendar" {
                    mark_calendar(&mut current);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::Parse(format!("multistatus text: {}", e)))?;
                append(&mut current, capture, &text);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).to_string();
                append(&mut current, capture, &text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(done) = current.take() {
                        responses.push(done);
                    }
                }
                b"href" | b"displayname" | b"calendar-data" => capture = Capture::None,
                b"resourcetype" => in_resourcetype = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SyncError::Parse(format!(
                    "multistatus at {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(responses)
}

fn mark_calendar(current: &mut Option<DavResponse>) {
    if let Some(response) = current.as_mut() {
        response.is_calendar = true;
    }
}

fn append(current: &mut Option<DavResponse>, capture: Capture, text: &str) {
    let Some(response) = current.as_mut() else {
        return;
    };
    let slot = match capture {
        Capture::None => return,
        Capture::Href => {
            response.href.push_str(text);
            return;
        }
        Capture::DisplayName => &mut response.display_name,
        Capture::CalendarData => &mut response.calendar_data,
    };
    slot.get_or_insert_with(String::new).push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/calendars/jan/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/calendars/jan/personal/</d:href>
    <d:propstat><d:prop>
      <d:displayname>Personal</d:displayname>
      <d:resourcetype><d:collection/><cal:calendar/></d:resourcetype>
    </d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/calendars/jan/rooster/</d:href>
    <d:propstat><d:prop>
      <d:displayname>Rooster &amp; Diensten</d:displayname>
      <d:resourcetype><d:collection/><cal:calendar/></d:resourcetype>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn discovery_keeps_only_calendars() {
        let responses = parse_multistatus(DISCOVERY).unwrap();
        assert_eq!(responses.len(), 3);
        let calendars: Vec<_> = responses.iter().filter(|r| r.is_calendar).collect();
        assert_eq!(calendars.len(), 2);
        assert_eq!(calendars[1].href, "/dav/calendars/jan/rooster/");
        assert_eq!(calendars[1].display_name.as_deref(), Some("Rooster & Diensten"));
    }

    #[test]
    fn report_carries_calendar_data() {
        let xml = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/calendars/jan/rooster/a.ics</d:href>
    <d:propstat><d:prop>
      <d:getetag>"1"</d:getetag>
      <c:calendar-data><![CDATA[BEGIN:VCALENDAR
VERSION:2.0
BEGIN:VEVENT
UID:a
DTSTART:20250101T080000Z
END:VEVENT
END:VCALENDAR]]></c:calendar-data>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].calendar_data.as_deref().unwrap().contains("UID:a"));
    }

    #[test]
    fn object_urls_keep_uids_apart() {
        let calendar = Url::parse("https://dav.example.nl/calendars/jan/rooster/").unwrap();
        let url = |uid: &str| object_url(&calendar, uid).unwrap().to_string();
        assert_eq!(
            url("abc-123@rostersync"),
            "https://dav.example.nl/calendars/jan/rooster/abc-123@rostersync.ics"
        );
        let names = [url("a/b"), url("a b"), url("a_b"), url("a%2Fb")];
        for (i, name) in names.iter().enumerate() {
            assert!(name.starts_with("https://dav.example.nl/calendars/jan/rooster/"));
            assert!(names[i + 1..].iter().all(|other| other != name), "{} repeated", name);
        }
        assert!(url("a/b").ends_with("/rooster/a%2Fb.ics"));
    }

    #[test]
    fn report_window_ends_at_cutoff() {
        let cutoff = DateTime::parse_from_rfc3339("2025-07-15T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(report_body(cutoff).contains(r#"end="20250715T060000Z""#));
    }
}
