use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::clients::caldav::CalDavSettings;
use crate::clients::imap_inbox::ImapSettings;
use crate::clients::webdriver::WebDriverSettings;
use crate::errors::SyncError;
use crate::service::document_retriever::{ElementMap, PortalCredentials, RetrieverOptions};
use crate::service::retry::RetryPolicy;
use crate::service::trigger_detector::DEFAULT_SCAN_LIMIT;
use crate::tasks::schedule::{self, ScheduleWindow};

/// Raw `KEY=VALUE` pairs from the file named by `CONFIG_FILE`.
#[derive(Debug, Default, Clone)]
pub struct AppConfig {
    values: HashMap<String, String>,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path, e)))?;
        Self::parse(&content)
    }

    /// Dotenv syntax. Values may carry one pair of matching quotes.
    pub fn parse(content: &str) -> Result<Self, SyncError> {
        let mut values = HashMap::new();
        for (number, line) in (1..).zip(content.lines()) {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            let entry = entry.strip_prefix("export ").unwrap_or(entry);
            let (key, value) = entry
                .split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| SyncError::Config(format!("invalid config line {}: {}", number, line)))?;
            values.insert(key.to_string(), unquote(value).to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    /// `CONFIG_FILE` if set, otherwise empty. The environment is consulted
    /// by [`AppConfig::lookup`] for anything the file does not define.
    pub fn from_env() -> Result<Self, SyncError> {
        match env::var("CONFIG_FILE") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).or_else(|| env::var(key).ok())
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub credentials: PortalCredentials,
    pub elements: ElementMap,
    pub retriever: RetrieverOptions,
    pub webdriver: WebDriverSettings,
}

#[derive(Debug, Clone)]
pub struct InboxSettings {
    pub imap: ImapSettings,
    pub trigger_sender: String,
    pub scan_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub window: ScheduleWindow,
    pub timezone: Tz,
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub portal: PortalSettings,
    pub inbox: InboxSettings,
    pub caldav: CalDavSettings,
    pub schedule: ScheduleSettings,
    pub retention_days: u32,
    pub retry: RetryPolicy,
    pub state_file: Option<PathBuf>,
    pub log: LogSettings,
}

/// Typed reads over a key lookup; every failure names the key.
struct Reader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, SyncError> {
        self.optional(key)
            .ok_or_else(|| SyncError::Config(format!("{} must be set", key)))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, SyncError>
    where
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| SyncError::Config(format!("{}={:?}: {}", key, raw, e))),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, SyncError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(SyncError::Config(format!("{}={:?} is not a boolean", key, v))),
        }
    }
}

impl Settings {
    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        Self::from_lookup(|key| config.lookup(key))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = Reader { lookup };

        let timezone_name = r.or("TIMEZONE", "Europe/Amsterdam");
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| SyncError::Config(format!("TIMEZONE={:?} is not a known zone", timezone_name)))?;

        let portal = PortalSettings {
            credentials: PortalCredentials {
                username: r.required("PORTAL_USERNAME")?,
                password: r.required("PORTAL_PASSWORD")?,
            },
            elements: ElementMap::from_lookup(|key| r.optional(key))?,
            retriever: RetrieverOptions {
                portal_url: r.required("PORTAL_URL")?,
                export_timeout: Duration::from_secs(r.parsed("EXPORT_TIMEOUT_SECS", 60u64)?),
                login_timeout: Duration::from_secs(r.parsed("LOGIN_TIMEOUT_SECS", 10u64)?),
                settle_delay: Duration::from_millis(r.parsed("NAVIGATION_SETTLE_MS", 500u64)?),
                max_navigation_steps: r.parsed("MAX_NAVIGATION_STEPS", 60usize)?,
                archive_dir: r.optional("ARCHIVE_DIR").map(PathBuf::from),
            },
            webdriver: WebDriverSettings {
                endpoint: r.or("WEBDRIVER_URL", "http://localhost:9515"),
                download_dir: PathBuf::from(r.or("DOWNLOAD_DIR", "./temp_downloads")),
                headless: r.flag("HEADLESS", true)?,
            },
        };

        let inbox = InboxSettings {
            imap: ImapSettings {
                host: r.or("IMAP_HOST", "imap.gmail.com"),
                port: r.parsed("IMAP_PORT", 993u16)?,
                username: r.required("IMAP_USERNAME")?,
                password: r.required("IMAP_PASSWORD")?,
                mailbox: r.or("IMAP_MAILBOX", "INBOX"),
            },
            trigger_sender: r.or("TRIGGER_EMAIL_SENDER", "noreply@staff.nl"),
            scan_limit: r.parsed("INBOX_SCAN_LIMIT", DEFAULT_SCAN_LIMIT)?.max(1),
        };

        let caldav = CalDavSettings {
            url: r.required("CALDAV_URL")?,
            username: r.required("CALDAV_USERNAME")?,
            password: r.required("CALDAV_PASSWORD")?,
            calendar_name: r.or("CALDAV_CALENDAR_NAME", "Rooster"),
            calendar_url: r.optional("CALDAV_CALENDAR_URL"),
            floating_tz: timezone,
        };

        let interval_minutes: u64 = r.parsed("CHECK_INTERVAL_MINUTES", 10)?;
        if interval_minutes == 0 {
            return Err(SyncError::Config("CHECK_INTERVAL_MINUTES must be at least 1".to_string()));
        }
        let schedule = ScheduleSettings {
            window: ScheduleWindow::new(
                schedule::parse_days(&r.or("ACTIVE_DAYS", "mon,tue,wed,thu,fri"))?,
                r.parsed("START_HOUR", 8u32)?,
                r.parsed("END_HOUR", 20u32)?,
                timezone,
            )?,
            timezone,
            check_interval: Duration::from_secs(interval_minutes * 60),
        };

        let retention_days: u32 = r.parsed("RETENTION_DAYS", 90)?;
        if retention_days == 0 {
            return Err(SyncError::Config("RETENTION_DAYS must be at least 1".to_string()));
        }

        let defaults = RetryPolicy::default();
        let retry = defaults
            .clone()
            .with_max_attempts(r.parsed("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?)
            .with_base_delay(Duration::from_millis(r.parsed(
                "RETRY_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?))
            .with_backoff_factor(r.parsed("RETRY_BACKOFF_FACTOR", defaults.backoff_factor)?);

        Ok(Self {
            portal,
            inbox,
            caldav,
            schedule,
            retention_days,
            retry,
            state_file: r.optional("STATE_FILE").map(PathBuf::from),
            log: LogSettings {
                level: r.or("LOG_LEVEL", "info"),
                file: r.optional("LOG_FILE").map(PathBuf::from),
            },
        })
    }
}
