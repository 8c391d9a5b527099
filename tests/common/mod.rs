#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rosterSync::errors::SyncError;
use rosterSync::models::calendar::RemoteEntry;
use rosterSync::models::inbox::{InboxMarker, InboxMessage};
use rosterSync::models::period::Period;
use rosterSync::service::calendar_publisher::{CalendarSession, CalendarStore};
use rosterSync::service::document_retriever::{
    BrowserError, BrowserLauncher, BrowserSession, DocumentRetriever, ElementMap,
    PortalCredentials, RetrieverOptions,
};
use rosterSync::service::ics_codec::IcsCodec;

pub const SENDER: &str = "noreply@staff.nl";

/// Two shifts in week 43 of 2025; the second has no UID.
pub const WEEK_43: &str = "BEGIN:VCALENDAR\r
VERSION:2.0\r
PRODID:-//Portal//Roster//NL\r
METHOD:PUBLISH\r
BEGIN:VEVENT\r
UID:shift-20251020@portal\r
DTSTART:20251020T060000Z\r
DTEND:20251020T143000Z\r
SUMMARY:Vroege dienst\r
END:VEVENT\r
BEGIN:VEVENT\r
DTSTART:20251022T120000Z\r
DTEND:20251022T200000Z\r
SUMMARY:Late dienst\r
END:VEVENT\r
END:VCALENDAR\r
";

pub fn element_map() -> ElementMap {
    let ids = HashMap::from([
        ("PORTAL_USERNAME_FIELD", "username"),
        ("PORTAL_PASSWORD_FIELD", "password"),
        ("PORTAL_LOGIN_BUTTON", "loginButton"),
        ("PORTAL_WEEK_DISPLAY", "weekLabel"),
        ("PORTAL_PREV_WEEK_BUTTON", "prevWeek"),
        ("PORTAL_NEXT_WEEK_BUTTON", "nextWeek"),
        ("PORTAL_EXPORT_VIEW", "monthView"),
        ("PORTAL_EXPORT_BUTTON", "exportButton"),
    ]);
    ElementMap::from_lookup(|key| ids.get(key).map(|v| v.to_string())).unwrap()
}

pub fn retriever_options() -> RetrieverOptions {
    RetrieverOptions {
        portal_url: "https://portal.example.nl/login".to_string(),
        export_timeout: Duration::from_millis(300),
        login_timeout: Duration::from_millis(300),
        settle_delay: Duration::ZERO,
        max_navigation_steps: 60,
        archive_dir: None,
    }
}

pub fn retriever(portal: FakePortal) -> DocumentRetriever<FakePortal> {
    DocumentRetriever::new(
        portal,
        element_map(),
        PortalCredentials {
            username: "jan@example.nl".to_string(),
            password: "geheim".to_string(),
        },
        retriever_options(),
    )
}

pub struct PortalState {
    pub displayed: Period,
    pub follows_clicks: bool,
    pub accepts_login: bool,
    pub has_login_form: bool,
    pub logged_in: bool,
    pub export: Option<Vec<u8>>,
    /// Checks for which the login form still shows after a good login.
    pub login_lingers: usize,
    /// Polls that see the download file before it has any content.
    pub empty_downloads: usize,
    pub export_requested: bool,
    pub launch_fails: bool,
    pub missing: Vec<String>,
    pub launches: usize,
    pub closes: usize,
    pub clicks: Vec<String>,
}

/// Scripted stand-in for the roster portal behind a browser.
#[derive(Clone)]
pub struct FakePortal {
    pub state: Arc<Mutex<PortalState>>,
}

impl FakePortal {
    pub fn showing(displayed: Period) -> Self {
        Self {
            state: Arc::new(Mutex::new(PortalState {
                displayed,
                follows_clicks: true,
                accepts_login: true,
                has_login_form: true,
                logged_in: false,
                export: Some(WEEK_43.as_bytes().to_vec()),
                login_lingers: 0,
                empty_downloads: 0,
                export_requested: false,
                launch_fails: false,
                missing: Vec::new(),
                launches: 0,
                closes: 0,
                clicks: Vec::new(),
            })),
        }
    }

    pub fn with<F: FnOnce(&mut PortalState)>(self, change: F) -> Self {
        change(&mut self.state.lock().unwrap());
        self
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }
}

fn shifted(period: Period, weeks: i64) -> Period {
    let monday = period.monday().unwrap();
    Period::containing(monday + chrono::Duration::weeks(weeks))
}

#[async_trait]
impl BrowserLauncher for FakePortal {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.launch_fails {
            return Err(BrowserError::Transport("connection refused".to_string()));
        }
        state.launches += 1;
        state.logged_in = false;
        state.export_requested = false;
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<PortalState>>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&mut self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn is_present(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let mut state = self.state.lock().unwrap();
        let login_control = matches!(selector, "#username" | "#password" | "#loginButton");
        if login_control && state.logged_in && state.login_lingers > 0 {
            state.login_lingers -= 1;
            return Ok(true);
        }
        Ok(if login_control {
            state.has_login_form && !state.logged_in
        } else {
            !state.missing.iter().any(|m| m == selector)
        })
    }

    async fn fill(&mut self, _selector: &str, _text: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.missing.iter().any(|m| m == selector) {
            return Err(BrowserError::ElementMissing(selector.to_string()));
        }
        state.clicks.push(selector.to_string());
        match selector {
            "#loginButton" => state.logged_in = state.accepts_login,
            "#nextWeek" if state.follows_clicks => state.displayed = shifted(state.displayed, 1),
            "#prevWeek" if state.follows_clicks => state.displayed = shifted(state.displayed, -1),
            "#exportButton" => state.export_requested = true,
            _ => {}
        }
        Ok(())
    }

    async fn text_of(&mut self, selector: &str) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        if selector != "#weekLabel" {
            return Err(BrowserError::ElementMissing(selector.to_string()));
        }
        Ok(format!("{} week {}", state.displayed.year(), state.displayed.week()))
    }

    async fn take_download(&mut self) -> Result<Option<Vec<u8>>, BrowserError> {
        let mut state = self.state.lock().unwrap();
        if !state.export_requested {
            return Ok(None);
        }
        if state.export.is_some() && state.empty_downloads > 0 {
            state.empty_downloads -= 1;
            return Ok(Some(Vec::new()));
        }
        Ok(state.export.clone())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

pub fn notification(uid: u32, body: &str, received_at: DateTime<Utc>) -> InboxMessage {
    InboxMessage {
        id: InboxMarker(uid),
        sender: format!("Rooster <{}>", SENDER),
        received_at,
        subject: "Nieuw rooster beschikbaar".to_string(),
        body: body.to_string(),
    }
}

#[derive(Default)]
pub struct StoreState {
    pub objects: HashMap<String, String>,
    /// Entries the server reports for range queries, keyed by uid.
    pub dated: HashMap<String, DateTime<Utc>>,
    pub connects: usize,
    pub releases: usize,
    pub upsert_failures: Vec<SyncError>,
    pub query_failure: Option<fn() -> SyncError>,
    pub failing_deletes: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryCalendar {
    pub state: Arc<Mutex<StoreState>>,
}

#[derive(Clone)]
pub struct MemoryCalendarSession {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl CalendarStore for MemoryCalendar {
    type Session = MemoryCalendarSession;

    async fn connect(&self) -> Result<MemoryCalendarSession, SyncError> {
        self.state.lock().unwrap().connects += 1;
        Ok(MemoryCalendarSession {
            state: self.state.clone(),
        })
    }

    fn release(&self, _session: MemoryCalendarSession) {
        self.state.lock().unwrap().releases += 1;
    }
}

#[async_trait]
impl CalendarSession for MemoryCalendarSession {
    async fn upsert(&self, uid: &str, document: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if !state.upsert_failures.is_empty() {
            return Err(state.upsert_failures.remove(0));
        }
        let parsed = IcsCodec::new(chrono_tz::UTC).parse(document.as_bytes())?;
        state.dated.insert(uid.to_string(), parsed.entries[0].start);
        state.objects.insert(uid.to_string(), document.to_string());
        Ok(())
    }

    async fn query_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RemoteEntry>, SyncError> {
        let state = self.state.lock().unwrap();
        if let Some(failure) = state.query_failure {
            return Err(failure());
        }
        Ok(state
            .dated
            .iter()
            .filter(|(_, start)| **start < cutoff)
            .map(|(uid, start)| RemoteEntry {
                uid: uid.clone(),
                href: format!("/calendars/jan/rooster/{}.ics", uid),
                start: *start,
            })
            .collect())
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(&entry.uid) {
            return Err(SyncError::Remote(format!("cannot delete {}", entry.uid)));
        }
        state.dated.remove(&entry.uid);
        state.objects.remove(&entry.uid);
        state.deleted.push(entry.uid.clone());
        Ok(())
    }
}
