//! Fetches the roster export from the portal through a browser session.
//!
//! The retriever never retries. It turns whatever went wrong into one of
//! `Authentication`, `Navigation`, `Export` or `Connection` so the
//! orchestrator can decide what happens to the trigger.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

use crate::errors::SyncError;
use crate::models::period::Period;
use crate::service::week_planner::{self, Direction};

const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("element {0} not found")]
    ElementMissing(String),
    #[error("browser unreachable: {0}")]
    Transport(String),
    #[error("browser refused the command: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn is_present(&mut self, selector: &str) -> Result<bool, BrowserError>;
    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;
    async fn text_of(&mut self, selector: &str) -> Result<String, BrowserError>;
    /// Bytes of a finished download, if the browser produced one.
    async fn take_download(&mut self) -> Result<Option<Vec<u8>>, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Named controls of the portal UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalElement {
    UsernameField,
    PasswordField,
    LoginButton,
    WeekDisplay,
    PrevWeekButton,
    NextWeekButton,
    ExportView,
    ExportButton,
}

impl PortalElement {
    pub const ALL: [PortalElement; 8] = [
        PortalElement::UsernameField,
        PortalElement::PasswordField,
        PortalElement::LoginButton,
        PortalElement::WeekDisplay,
        PortalElement::PrevWeekButton,
        PortalElement::NextWeekButton,
        PortalElement::ExportView,
        PortalElement::ExportButton,
    ];

    /// Configuration key holding the element's selector.
    pub fn config_key(self) -> &'static str {
        match self {
            PortalElement::UsernameField => "PORTAL_USERNAME_FIELD",
            PortalElement::PasswordField => "PORTAL_PASSWORD_FIELD",
            PortalElement::LoginButton => "PORTAL_LOGIN_BUTTON",
            PortalElement::WeekDisplay => "PORTAL_WEEK_DISPLAY",
            PortalElement::PrevWeekButton => "PORTAL_PREV_WEEK_BUTTON",
            PortalElement::NextWeekButton => "PORTAL_NEXT_WEEK_BUTTON",
            PortalElement::ExportView => "PORTAL_EXPORT_VIEW",
            PortalElement::ExportButton => "PORTAL_EXPORT_BUTTON",
        }
    }
}

/// Selector for every [`PortalElement`]; nothing in the retriever knows the
/// portal's markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementMap {
    selectors: HashMap<PortalElement, String>,
}

impl ElementMap {
    /// Fails when any element has no selector. Bare ids (`loginButton`) are
    /// turned into CSS id selectors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut selectors = HashMap::new();
        for element in PortalElement::ALL {
            let raw = lookup(element.config_key())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SyncError::Config(format!("{} must be set", element.config_key())))?;
            selectors.insert(element, as_selector(&raw));
        }
        Ok(Self { selectors })
    }

    pub fn selector(&self, element: PortalElement) -> &str {
        self.selectors
            .get(&element)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn as_selector(raw: &str) -> String {
    let is_plain_id = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if is_plain_id {
        format!("#{}", raw)
    } else {
        raw.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    pub portal_url: String,
    pub export_timeout: Duration,
    /// How long the login form may stay on screen after submitting before
    /// the credentials count as rejected.
    pub login_timeout: Duration,
    /// Pause after each week click so the view can redraw.
    pub settle_delay: Duration,
    pub max_navigation_steps: usize,
    /// Copies of every export land here when set.
    pub archive_dir: Option<PathBuf>,
}

pub struct DocumentRetriever<L: BrowserLauncher> {
    launcher: L,
    elements: ElementMap,
    credentials: PortalCredentials,
    options: RetrieverOptions,
}

impl<L: BrowserLauncher> DocumentRetriever<L> {
    pub fn new(
        launcher: L,
        elements: ElementMap,
        credentials: PortalCredentials,
        options: RetrieverOptions,
    ) -> Self {
        Self {
            launcher,
            elements,
            credentials,
            options,
        }
    }

    /// Logs in, moves the week view to `target` (or leaves the portal's
    /// default week when `None`) and returns the exported document bytes.
    pub async fn retrieve(&self, target: Option<Period>) -> Result<Vec<u8>, SyncError> {
        tracing::info!(week = ?target.map(|p| p.to_string()), "retrieving roster export");
        let mut session = self.launcher.launch().await.map_err(connection)?;
        let result = self.run_flow(session.as_mut(), target).await;
        if let Err(err) = session.close().await {
            tracing::warn!(error = %err, "browser session did not close cleanly");
        }
        let bytes = result?;
        if let Some(dir) = &self.options.archive_dir {
            self.archive(dir, target, &bytes).await;
        }
        Ok(bytes)
    }

    async fn run_flow(
        &self,
        session: &mut dyn BrowserSession,
        target: Option<Period>,
    ) -> Result<Vec<u8>, SyncError> {
        self.authenticate(session).await?;
        if let Some(target) = target {
            self.navigate(session, target).await?;
        }
        self.export(session).await
    }

    async fn authenticate(&self, session: &mut dyn BrowserSession) -> Result<(), SyncError> {
        session
            .goto(&self.options.portal_url)
            .await
            .map_err(connection)?;

        let username = self.elements.selector(PortalElement::UsernameField);
        let password = self.elements.selector(PortalElement::PasswordField);
        let login = self.elements.selector(PortalElement::LoginButton);
        for selector in [username, password, login] {
            let present = session.is_present(selector).await.map_err(connection)?;
            if !present {
                return Err(SyncError::Authentication(format!(
                    "login form element {} missing",
                    selector
                )));
            }
        }

        session
            .fill(username, &self.credentials.username)
            .await
            .map_err(|e| classify(e, SyncError::Authentication))?;
        session
            .fill(password, &self.credentials.password)
            .await
            .map_err(|e| classify(e, SyncError::Authentication))?;
        session
            .click(login)
            .await
            .map_err(|e| classify(e, SyncError::Authentication))?;

        // The portal keeps showing the login form when the credentials are wrong.
        let started = Instant::now();
        while session.is_present(password).await.map_err(connection)? {
            if started.elapsed() >= self.options.login_timeout {
                return Err(SyncError::Authentication(
                    "portal rejected the credentials".to_string(),
                ));
            }
            sleep(LOGIN_POLL_INTERVAL).await;
        }
        tracing::info!(elapsed = ?started.elapsed(), "logged in to portal");
        Ok(())
    }

    async fn navigate(&self, session: &mut dyn BrowserSession, target: Period) -> Result<(), SyncError> {
        let current = self.displayed_period(session).await?;
        let steps = week_planner::plan(current, target);
        if steps.len() > self.options.max_navigation_steps {
            return Err(SyncError::Navigation(format!(
                "{} is {} weeks away from {}, limit is {}",
                target,
                steps.len(),
                current,
                self.options.max_navigation_steps
            )));
        }
        tracing::info!(from = %current, to = %target, steps = steps.len(), "navigating week view");

        for step in &steps {
            let control = match step.direction {
                Direction::Forward => PortalElement::NextWeekButton,
                Direction::Backward => PortalElement::PrevWeekButton,
            };
            session
                .click(self.elements.selector(control))
                .await
                .map_err(|e| classify(e, SyncError::Navigation))?;
            if !self.options.settle_delay.is_zero() {
                sleep(self.options.settle_delay).await;
            }
        }

        let reached = self.displayed_period(session).await?;
        if reached != target {
            return Err(SyncError::Navigation(format!(
                "ended on {} instead of {} after {} clicks",
                reached,
                target,
                steps.len()
            )));
        }
        Ok(())
    }

    async fn displayed_period(&self, session: &mut dyn BrowserSession) -> Result<Period, SyncError> {
        let label = session
            .text_of(self.elements.selector(PortalElement::WeekDisplay))
            .await
            .map_err(|e| classify(e, SyncError::Navigation))?;
        Period::from_display_label(&label)
            .map_err(|_| SyncError::Navigation(format!("cannot read week display {:?}", label)))
    }

    async fn export(&self, session: &mut dyn BrowserSession) -> Result<Vec<u8>, SyncError> {
        session
            .click(self.elements.selector(PortalElement::ExportView))
            .await
            .map_err(|e| classify(e, SyncError::Export))?;
        session
            .click(self.elements.selector(PortalElement::ExportButton))
            .await
            .map_err(|e| classify(e, SyncError::Export))?;

        // Browsers may create the final file empty and fill it afterwards.
        let started = Instant::now();
        let mut saw_empty = false;
        let waited = timeout(self.options.export_timeout, async {
            loop {
                match session.take_download().await {
                    Ok(Some(bytes)) if !bytes.is_empty() => return Ok(bytes),
                    Ok(Some(_)) => {
                        saw_empty = true;
                        sleep(DOWNLOAD_POLL_INTERVAL).await;
                    }
                    Ok(None) => sleep(DOWNLOAD_POLL_INTERVAL).await,
                    Err(err) => return Err(classify(err, SyncError::Export)),
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(bytes)) => {
                tracing::info!(bytes = bytes.len(), elapsed = ?started.elapsed(), "roster exported");
                Ok(bytes)
            }
            Ok(Err(err)) => Err(err),
            Err(_) if saw_empty => Err(SyncError::Export(format!(
                "export file still empty after {:?}",
                self.options.export_timeout
            ))),
            Err(_) => Err(SyncError::Export(format!(
                "no document within {:?}",
                self.options.export_timeout
            ))),
        }
    }

    async fn archive(&self, dir: &std::path::Path, target: Option<Period>, bytes: &[u8]) {
        let name = match target {
            Some(period) => format!("roster_{}_week_{:02}.ics", period.year(), period.week()),
            None => format!("roster_{}.ics", chrono::Utc::now().format("%Y%m%dT%H%M%S")),
        };
        let path = dir.join(name);
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, bytes).await
        }
        .await;
        match written {
            Ok(()) => tracing::info!(path = %path.display(), "archived roster export"),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not archive roster export"),
        }
    }
}

fn connection(err: BrowserError) -> SyncError {
    SyncError::Connection(err.to_string())
}

/// Transport problems stay connection errors; anything else belongs to the
/// step that was running.
fn classify(err: BrowserError, step: fn(String) -> SyncError) -> SyncError {
    match err {
        BrowserError::Transport(_) => connection(err),
        other => step(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_become_css_selectors() {
        assert_eq!(as_selector("loginButton"), "#loginButton");
        assert_eq!(as_selector("input[name=user]"), "input[name=user]");
        assert_eq!(as_selector("#week"), "#week");
    }

    #[test]
    fn element_map_requires_every_control() {
        let err = ElementMap::from_lookup(|key| {
            (key != "PORTAL_EXPORT_BUTTON").then(|| "x".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PORTAL_EXPORT_BUTTON"));

        let map = ElementMap::from_lookup(|key| Some(key.to_lowercase())).unwrap();
        assert_eq!(map.selector(PortalElement::WeekDisplay), "#portal_week_display");
    }

    #[test]
    fn transport_errors_stay_connection_errors() {
        let err = classify(BrowserError::Transport("refused".to_string()), SyncError::Export);
        assert!(matches!(err, SyncError::Connection(_)));
        let err = classify(BrowserError::ElementMissing("#x".to_string()), SyncError::Export);
        assert!(matches!(err, SyncError::Export(_)));
    }
}
