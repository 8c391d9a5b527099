//! Minimal W3C WebDriver client (chromedriver) over reqwest.
//!
//! Downloads go to a fresh directory per session; `take_download` hands back
//! the first file the browser has finished writing there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::service::document_retriever::{BrowserError, BrowserLauncher, BrowserSession};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const PARTIAL_SUFFIXES: [&str; 3] = [".crdownload", ".part", ".tmp"];

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    pub endpoint: String,
    pub download_dir: PathBuf,
    pub headless: bool,
}

pub struct WebDriverLauncher {
    http: reqwest::Client,
    settings: WebDriverSettings,
}

impl WebDriverLauncher {
    pub fn new(settings: WebDriverSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn capabilities(&self, download_dir: &Path) -> Value {
        let mut args = vec![
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--window-size=1920,1080",
        ];
        if self.settings.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "prefs": {
                            "download.default_directory": download_dir.to_string_lossy(),
                            "download.prompt_for_download": false,
                            "safebrowsing.enabled": true
                        }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let download_dir = self
            .settings
            .download_dir
            .join(format!("session-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| BrowserError::Transport(format!("cannot create {}: {}", download_dir.display(), e)))?;

        let url = format!("{}/session", self.settings.endpoint.trim_end_matches('/'));
        let value = send(self.http.post(&url).json(&self.capabilities(&download_dir)), "new session").await?;
        let created: NewSession = serde_json::from_value(value)
            .map_err(|e| BrowserError::Protocol(format!("unexpected new session reply: {}", e)))?;
        tracing::debug!(session = %created.session_id, dir = %download_dir.display(), "browser session started");

        Ok(Box::new(WebDriverSession {
            http: self.http.clone(),
            base: format!("{}/{}", url, created.session_id),
            download_dir,
        }))
    }
}

pub struct WebDriverSession {
    http: reqwest::Client,
    base: String,
    download_dir: PathBuf,
}

impl WebDriverSession {
    async fn command(&self, path: &str, body: Value) -> Result<Value, BrowserError> {
        let url = format!("{}/{}", self.base, path);
        send(self.http.post(&url).json(&body), path).await
    }

    async fn find(&self, selector: &str) -> Result<String, BrowserError> {
        let found = self
            .command("element", json!({"using": "css selector", "value": selector}))
            .await
            .map_err(|err| match err {
                BrowserError::Protocol(msg) if msg.contains("no such element") => {
                    BrowserError::ElementMissing(selector.to_string())
                }
                other => other,
            })?;
        found
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Protocol(format!("no element reference for {}", selector)))
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        self.command("url", json!({ "url": url })).await.map(|_| ())
    }

    async fn is_present(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let found = self
            .command("elements", json!({"using": "css selector", "value": selector}))
            .await?;
        Ok(found.as_array().is_some_and(|list| !list.is_empty()))
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self.find(selector).await?;
        self.command(&format!("element/{}/clear", element), json!({}))
            .await?;
        self.command(&format!("element/{}/value", element), json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let element = self.find(selector).await?;
        self.command(&format!("element/{}/click", element), json!({}))
            .await
            .map(|_| ())
    }

    async fn text_of(&mut self, selector: &str) -> Result<String, BrowserError> {
        let element = self.find(selector).await?;
        let url = format!("{}/element/{}/text", self.base, element);
        let value = send(self.http.get(&url), "element text").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn take_download(&mut self) -> Result<Option<Vec<u8>>, BrowserError> {
        let Some(path) = finished_download(&self.download_dir).await? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| BrowserError::Transport(format!("cannot read {}: {}", path.display(), e)))?;
        tracing::debug!(file = %path.display(), bytes = bytes.len(), "download finished");
        Ok(Some(bytes))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let closed = send(self.http.delete(&self.base), "delete session").await;
        if let Err(err) = tokio::fs::remove_dir_all(&self.download_dir).await {
            tracing::debug!(error = %err, "download dir not removed");
        }
        closed.map(|_| ())
    }
}

/// First regular file in `dir` that is not a partial download.
pub async fn finished_download(dir: &Path) -> Result<Option<PathBuf>, BrowserError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BrowserError::Transport(err.to_string())),
    };
    let mut finished = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BrowserError::Transport(e.to_string()))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let partial = PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix));
        if path.is_file() && !partial {
            finished.push(path);
        }
    }
    finished.sort();
    Ok(finished.into_iter().next())
}

async fn send(request: reqwest::RequestBuilder, what: &str) -> Result<Value, BrowserError> {
    let response = request
        .send()
        .await
        .map_err(|e| BrowserError::Transport(format!("{}: {}", what, e)))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| BrowserError::Protocol(format!("{}: unreadable reply: {}", what, e)))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(value);
    }
    let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    if status == StatusCode::NOT_FOUND && error == "no such element" {
        return Err(BrowserError::Protocol(format!("no such element: {}", message)));
    }
    Err(BrowserError::Protocol(format!("{} ({}): {} {}", what, status, error, message)))
}
