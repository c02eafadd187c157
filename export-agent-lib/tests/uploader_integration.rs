//! Integration tests for export uploads against wiremock

use camino::Utf8PathBuf;
use core::time::Duration;
use export_agent_lib::service::{HttpUploader, Uploader};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn export_dir(tmp: &tempfile::TempDir) -> Utf8PathBuf {
    let dir = Utf8PathBuf::try_from(tmp.path().join("uploads")).unwrap();
    fs::create_dir_all(dir.join("sourcecode.Repo")).unwrap();
    fs::write(dir.join("sourcecode.Repo/mock-00000.summary.json"), r#"{"count":1}"#).unwrap();
    dir
}

fn uploader() -> HttpUploader {
    HttpUploader::new(reqwest::Client::new()).with_retries(3, Duration::from_millis(10))
}

/// Names of the entries in a `tar.gz` archive
fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let mut tar = Vec::new();
    let _ = GzDecoder::new(bytes).read_to_end(&mut tar).unwrap();
    let mut archive = tar::Archive::new(tar.as_slice());
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_upload_puts_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = export_dir(&tmp);

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/exports/job-1"))
        .and(header("content-type", "application/gzip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/exports/job-1", server.uri());
    uploader().upload(&dir, &url).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let entries = archive_entries(&requests[0].body);
    assert!(
        entries.iter().any(|e| e.ends_with("sourcecode.Repo/mock-00000.summary.json")),
        "unexpected entries {entries:?}"
    );
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = export_dir(&tmp);

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    uploader().upload(&dir, &server.uri()).await.unwrap();
}

#[tokio::test]
async fn test_client_errors_fail_at_once() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = export_dir(&tmp);

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string("signature expired"))
        .expect(1)
        .mount(&server)
        .await;

    let err = uploader().upload(&dir, &server.uri()).await.unwrap_err();
    assert!(err.to_string().contains("signature expired"));
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = export_dir(&tmp);

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let _ = uploader().upload(&dir, &server.uri()).await.unwrap_err();
}
