//! Integration tests for the api client and retry policy against wiremock

use chrono::{DateTime, Utc};
use core::time::Duration;
use export_agent_lib::plugin::{AgentDelegate, GitRepoFetch};
use export_agent_lib::request::{HttpApi, RetryClient, RetryPolicy};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Records pause and resume notices sent by the retry client
#[derive(Debug, Default)]
struct RecordingDelegate {
    events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl AgentDelegate for RecordingDelegate {
    fn export_git_repo(&self, _fetch: GitRepoFetch) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_pause_event(&self, _id: String, _resume_at: DateTime<Utc>) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        self.events.lock().unwrap().push("pause".into());
        Box::pin(async { Ok(()) })
    }

    fn send_resume_event(&self, _id: String) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        self.events.lock().unwrap().push("resume".into());
        Box::pin(async { Ok(()) })
    }
}

/// A policy with every wait shortened to keep tests fast
fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        min_pause: Duration::from_millis(10),
        max_pause: Duration::from_millis(50),
        throttle_fallback_wait: Duration::from_millis(10),
        abuse_wait: Duration::from_millis(10),
        general_retry_base_delay: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

fn api(server: &MockServer, delegate: Arc<RecordingDelegate>) -> HttpApi {
    let retry = Arc::new(RetryClient::new(fast_policy(), delegate));
    HttpApi::new(&server.uri(), Some("secret"), retry).unwrap()
}

#[tokio::test]
async fn test_get_sends_token_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets"))
        .and(query_param("page", "2"))
        .and(header("authorization", "bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "widgets" })))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let value: Value = api.get("repos/acme/widgets", &[("page", "2")]).await.unwrap();
    assert_eq!(value["name"], "widgets");
}

#[tokio::test]
async fn test_bad_gateway_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let value: Vec<u32> = api.get("/flaky", &[]).await.unwrap();
    assert_eq!(value, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_transient_failures_give_up_after_general_retries() {
    let server = MockServer::start().await;
    // One attempt plus two retries.
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let err = api.get::<Value>("down", &[]).await.unwrap_err();
    assert!(err.to_string().contains("502"));
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let err = api.get::<Value>("missing", &[]).await.unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_throttling_pauses_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let delegate = Arc::new(RecordingDelegate::default());
    let api = api(&server, Arc::clone(&delegate));
    let value: Value = api.get("busy", &[]).await.unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(delegate.events(), vec!["pause", "resume"]);
}

#[tokio::test]
async fn test_throttling_gives_up_after_throttled_retries() {
    let server = MockServer::start().await;
    // One attempt plus three throttled retries.
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let err = api.get::<Value>("busy", &[]).await.unwrap_err();
    assert!(err.to_string().contains("throttled"));
}

#[tokio::test]
async fn test_post_once_does_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mutate"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(RecordingDelegate::default()));
    let _ = api.post_once::<Value>("mutate", &json!({ "title": "x" })).await.unwrap_err();
}
