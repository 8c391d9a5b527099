use std::path::PathBuf;

use rosterSync::clients::webdriver::{WebDriverLauncher, WebDriverSettings};
use rosterSync::service::document_retriever::{BrowserError, BrowserLauncher, BrowserSession};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn driver() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": {"sessionId": "s1", "capabilities": {}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/session/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null})))
        .mount(&server)
        .await;
    server
}

fn launcher(server: &MockServer, download_dir: PathBuf) -> WebDriverLauncher {
    WebDriverLauncher::new(WebDriverSettings {
        endpoint: server.uri(),
        download_dir,
        headless: true,
    })
}

#[tokio::test]
async fn reads_the_week_label() {
    let server = driver().await;
    Mock::given(method("POST"))
        .and(path("/session/s1/element"))
        .and(body_partial_json(json!({"using": "css selector", "value": "#weekLabel"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": {"element-6066-11e4-a52e-4f735466cecf": "e7"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/s1/element/e7/text"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": "2025 week 40"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut session = launcher(&server, dir.path().to_path_buf()).launch().await.unwrap();
    assert_eq!(session.text_of("#weekLabel").await.unwrap(), "2025 week 40");
    session.close().await.unwrap();
}

#[tokio::test]
async fn missing_elements_are_reported_as_such() {
    let server = driver().await;
    Mock::given(method("POST"))
        .and(path("/session/s1/element"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "value": {"error": "no such element", "message": "Unable to locate element: #exportButton"}
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut session = launcher(&server, dir.path().to_path_buf()).launch().await.unwrap();
    let err = session.click("#exportButton").await.unwrap_err();
    assert!(matches!(err, BrowserError::ElementMissing(selector) if selector == "#exportButton"));
}

#[tokio::test]
async fn presence_checks_use_the_element_list() {
    let server = driver().await;
    Mock::given(method("POST"))
        .and(path("/session/s1/elements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut session = launcher(&server, dir.path().to_path_buf()).launch().await.unwrap();
    assert!(!session.is_present("#password").await.unwrap());
}

#[tokio::test]
async fn unreachable_driver_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = WebDriverLauncher::new(WebDriverSettings {
        endpoint: "http://127.0.0.1:9".to_string(),
        download_dir: dir.path().to_path_buf(),
        headless: true,
    });
    let err = launcher.launch().await.err().unwrap();
    assert!(matches!(err, BrowserError::Transport(_)));
}

#[tokio::test]
async fn no_download_until_the_file_is_complete() {
    let server = driver().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = launcher(&server, dir.path().to_path_buf()).launch().await.unwrap();
    assert_eq!(session.take_download().await.unwrap(), None);

    let session_dir = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    std::fs::write(session_dir.join("export.ics.crdownload"), b"BEGIN:VCAL").unwrap();
    assert_eq!(session.take_download().await.unwrap(), None);
    std::fs::write(session_dir.join("export.ics"), b"BEGIN:VCALENDAR").unwrap();
    assert_eq!(
        session.take_download().await.unwrap(),
        Some(b"BEGIN:VCALENDAR".to_vec())
    );

    session.close().await.unwrap();
    assert!(!session_dir.exists());
}
