//! The typed contract between the agent and an integration worker.
//!
//! Both sides see the same two traits. In the worker, [`Integration`] is implemented by
//! the provider logic and [`AgentDelegate`] by an RPC stub that calls back into the
//! agent. In the agent it is the other way around.

use crate::Result;
use crate::request::RetryPolicy;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Calls the agent offers to a running integration.
pub trait AgentDelegate: Send + Sync {
    /// Ask the agent to export a source repository (clone, history, blame).
    fn export_git_repo(&self, fetch: GitRepoFetch) -> BoxFuture<'_, Result<()>>;

    /// Tell the agent that the integration is pausing until `resume_at`.
    fn send_pause_event(&self, id: String, resume_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>>;

    /// Tell the agent that a pause ended early or as planned.
    fn send_resume_event(&self, id: String) -> BoxFuture<'_, Result<()>>;
}

/// Calls an integration offers to the agent.
pub trait Integration: Send + Sync {
    /// Hand the integration its agent delegate. Called once, before anything else.
    fn init(&self, agent: Arc<dyn AgentDelegate>) -> BoxFuture<'_, Result<()>>;

    fn export(&self, config: ExportConfig) -> BoxFuture<'_, Result<ExportResult>>;

    /// Run the mutation `action` with a JSON `data` payload.
    fn mutate(&self, action: String, data: String, config: ExportConfig) -> BoxFuture<'_, Result<MutateResult>>;

    fn onboard_export(&self, object_type: OnboardObjectType, config: ExportConfig) -> BoxFuture<'_, Result<OnboardExportResult>>;
}

/// Everything an integration needs to run one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    pub customer_id: String,

    /// Name of the integration, e.g. `github`.
    pub integration_name: String,

    /// Source system kind recorded on every exported object, e.g. `github`.
    pub ref_type: String,

    /// Provider-specific settings (urls, tokens, exclusions).
    #[serde(default)]
    pub integration: Map<String, Value>,

    /// Directory receiving session output.
    pub uploads_dir: Utf8PathBuf,

    /// Incremental state file shared by all sessions of the run.
    pub state_file: Utf8PathBuf,

    #[serde(default)]
    pub reprocess_historical: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Pages each fan-out stage may have queued.
    #[serde(default = "default_fanout_buffer")]
    pub fanout_buffer: usize,
}

/// Default for [`ExportConfig::fanout_buffer`].
pub const DEFAULT_FANOUT_BUFFER: usize = 10;

const fn default_fanout_buffer() -> usize {
    DEFAULT_FANOUT_BUFFER
}

/// Outcome of one project (repository, board) within an export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProject {
    pub id: String,
    pub ref_id: String,
    pub readable_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    #[serde(default)]
    pub projects: Vec<ExportProject>,
}

/// Coarse error codes a mutation can report back to the requester.
pub const MUTATE_ERROR_NOT_FOUND: &str = "not_found";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutateResult {
    /// Objects changed by the mutation, keyed by model name.
    #[serde(default)]
    pub mutated_objects: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnboardExportResult {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OnboardObjectType {
    Users,
    Repos,
    Projects,
    WorkConfig,
}

/// A request from an integration to export one source repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepoFetch {
    pub ref_type: String,
    pub repo_id: String,
    pub url: String,
    #[serde(default)]
    pub branch_url_template: String,
    #[serde(default)]
    pub commit_url_template: String,
    /// Pull requests whose branches should be exported along with the repository.
    #[serde(default)]
    pub prs: Vec<GitRepoFetchPr>,
}

/// Links a pull request to the branch and commits found in the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepoFetchPr {
    pub id: String,
    pub ref_id: String,
    pub url: String,
    pub branch_name: String,
    pub last_commit_sha: String,
}

/// Delegate that accepts and drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl AgentDelegate for NoopDelegate {
    fn export_git_repo(&self, _fetch: GitRepoFetch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_pause_event(&self, _id: String, _resume_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_resume_event(&self, _id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn test_onboard_object_type_names() {
        assert_eq!(OnboardObjectType::WorkConfig.to_string(), "workconfig");
        assert_eq!(OnboardObjectType::from_str("repos").unwrap(), OnboardObjectType::Repos);
        assert_eq!(
            serde_json::to_string(&OnboardObjectType::Users).unwrap(),
            "\"users\""
        );
    }

    #[test]
    fn test_mutate_result_omits_empty_error() {
        let json = serde_json::to_string(&MutateResult::default()).unwrap();
        assert_eq!(json, r#"{"mutated_objects":{}}"#);
    }

    #[test]
    fn test_export_config_defaults() {
        let json = r#"{
            "customer_id": "c1",
            "integration_name": "mock",
            "ref_type": "mock",
            "uploads_dir": "/tmp/uploads",
            "state_file": "/tmp/state.json"
        }"#;
        let config: ExportConfig = serde_json::from_str(json).unwrap();
        assert!(!config.reprocess_historical);
        assert!(config.integration.is_empty());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.fanout_buffer, DEFAULT_FANOUT_BUFFER);
    }
}
