//! End-to-end tests of the integration contract over an in-memory connection

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use export_agent_lib::export::{SUMMARY_EXTENSION, SessionSummary, entity};
use export_agent_lib::plugin::{
    AgentDelegate, DelegateServer, ExportConfig, GitRepoFetch, Handler, Integration, IntegrationClient, MOCK_INTEGRATION, MockIntegration,
    OnboardObjectType, Peer, serve,
};
use export_agent_lib::request::RetryPolicy;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::fs;
use std::sync::{Arc, Mutex};

/// Collects the repositories an integration asks the agent to export
#[derive(Debug, Default)]
struct RecordingDelegate {
    repos: Mutex<Vec<GitRepoFetch>>,
}

impl AgentDelegate for RecordingDelegate {
    fn export_git_repo(&self, fetch: GitRepoFetch) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        self.repos.lock().unwrap().push(fetch);
        Box::pin(async { Ok(()) })
    }

    fn send_pause_event(&self, _id: String, _resume_at: DateTime<Utc>) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_resume_event(&self, _id: String) -> BoxFuture<'_, export_agent_lib::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Serve the mock integration on one end of a duplex stream and return a client for the other
async fn connect(delegate: Arc<RecordingDelegate>) -> IntegrationClient {
    let (agent_side, worker_side) = tokio::io::duplex(64 * 1024);

    let (worker_read, worker_write) = tokio::io::split(worker_side);
    let _ = tokio::spawn(serve(worker_read, worker_write, Arc::new(MockIntegration::default())));

    let (agent_read, agent_write) = tokio::io::split(agent_side);
    let server = Arc::new(DelegateServer::default());
    let peer = Peer::start(agent_read, agent_write, Arc::clone(&server) as Arc<dyn Handler>);
    let client = IntegrationClient::new(peer, server);
    client.init(delegate).await.unwrap();
    client
}

fn config(root: &Utf8Path, uploads: &str, settings: Value) -> ExportConfig {
    ExportConfig {
        customer_id: "c1".into(),
        integration_name: MOCK_INTEGRATION.into(),
        ref_type: MOCK_INTEGRATION.into(),
        integration: settings.as_object().cloned().unwrap_or_default(),
        uploads_dir: root.join(uploads),
        state_file: root.join("last_processed.json"),
        reprocess_historical: false,
        retry: RetryPolicy::default(),
        fanout_buffer: 2,
    }
}

/// Summaries of every session written for `entity_type`
fn summaries(uploads: &Utf8Path, entity_type: &str) -> Vec<SessionSummary> {
    let dir = uploads.join(entity_type);
    let mut found = Vec::new();
    for entry in fs::read_dir(&dir).unwrap() {
        let path = entry.unwrap().path();
        if path.to_string_lossy().ends_with(SUMMARY_EXTENSION) {
            found.push(serde_json::from_slice(&fs::read(path).unwrap()).unwrap());
        }
    }
    found
}

fn root(tmp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap()
}

#[tokio::test]
async fn test_export_calls_back_into_the_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let root = root(&tmp);
    let delegate = Arc::new(RecordingDelegate::default());
    let client = connect(Arc::clone(&delegate)).await;

    let result = client
        .export(config(&root, "uploads", json!({ "repos": ["acme/widgets", "acme/gadgets"], "pull_requests": 4 })))
        .await
        .unwrap();

    let names: Vec<_> = result.projects.iter().map(|p| p.readable_id.as_str()).collect();
    assert_eq!(names, vec!["acme/widgets", "acme/gadgets"]);

    let repos = delegate.repos.lock().unwrap();
    assert_eq!(repos.len(), 2);
    // Pull request 3 has no commits and so no branch to export.
    assert_eq!(repos[0].prs.len(), 3);
    assert!(repos[0].url.ends_with("acme/widgets"));
}

#[tokio::test]
async fn test_second_run_exports_only_newer_pull_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let root = root(&tmp);
    let client = connect(Arc::new(RecordingDelegate::default())).await;

    let _ = client.export(config(&root, "first", json!({ "pull_requests": 10 }))).await.unwrap();
    let first: u64 = summaries(&root.join("first"), entity::PULL_REQUEST).iter().map(|s| s.count).sum();
    assert_eq!(first, 10);

    // A fresh worker sees the cursor through the shared state file.
    let client = connect(Arc::new(RecordingDelegate::default())).await;
    let _ = client.export(config(&root, "second", json!({ "pull_requests": 12 }))).await.unwrap();
    let second = summaries(&root.join("second"), entity::PULL_REQUEST);
    assert_eq!(second.iter().map(|s| s.count).sum::<u64>(), 2);
    assert!(second.iter().all(|s| !s.failed));
}

#[tokio::test]
async fn test_reprocess_historical_ignores_the_cursor() {
    let tmp = tempfile::tempdir().unwrap();
    let root = root(&tmp);
    let client = connect(Arc::new(RecordingDelegate::default())).await;

    let _ = client.export(config(&root, "first", json!({ "pull_requests": 5 }))).await.unwrap();

    let mut again = config(&root, "again", json!({ "pull_requests": 5 }));
    again.reprocess_historical = true;
    let _ = client.export(again).await.unwrap();

    let count: u64 = summaries(&root.join("again"), entity::PULL_REQUEST).iter().map(|s| s.count).sum();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn test_failed_repo_keeps_its_cursor() {
    let tmp = tempfile::tempdir().unwrap();
    let root = root(&tmp);
    let client = connect(Arc::new(RecordingDelegate::default())).await;

    let result = client
        .export(config(&root, "first", json!({ "pull_requests": 6, "fail_commits_of": 3 })))
        .await
        .unwrap();
    assert!(result.projects[0].error.is_some());

    let _ = client.export(config(&root, "second", json!({ "pull_requests": 6 }))).await.unwrap();
    let count: u64 = summaries(&root.join("second"), entity::PULL_REQUEST).iter().map(|s| s.count).sum();
    assert_eq!(count, 6);
}

#[tokio::test]
async fn test_mutate_and_onboard_over_the_connection() {
    let tmp = tempfile::tempdir().unwrap();
    let root = root(&tmp);
    let client = connect(Arc::new(RecordingDelegate::default())).await;

    let mutated = client
        .mutate("echo".into(), r#"{"title":"renamed"}"#.into(), config(&root, "uploads", json!({})))
        .await
        .unwrap();
    assert_eq!(mutated.mutated_objects["mock.Echo"][0]["title"], "renamed");

    let err = client
        .mutate("drop_tables".into(), "{}".into(), config(&root, "uploads", json!({})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported mutation"));

    let users = client
        .onboard_export(OnboardObjectType::Users, config(&root, "uploads", json!({ "pull_requests": 2 })))
        .await
        .unwrap();
    assert_eq!(users.records.len(), 2);
}

#[tokio::test]
async fn test_second_init_is_rejected() {
    let client = connect(Arc::new(RecordingDelegate::default())).await;
    let _ = client.init(Arc::new(RecordingDelegate::default())).await.unwrap_err();
}
