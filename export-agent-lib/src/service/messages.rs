//! Payloads exchanged with the backend.

use crate::plugin::{ExportProject, OnboardObjectType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Event topics.
pub mod topic {
    pub const EXPORT_REQUEST: &str = "agent.ExportRequest";
    pub const EXPORT_RESPONSE: &str = "agent.ExportResponse";
    pub const MUTATION_REQUEST: &str = "agent.MutationRequest";
    pub const MUTATION_RESPONSE: &str = "agent.MutationResponse";
    pub const ONBOARD_REQUEST: &str = "agent.OnboardRequest";
    pub const ONBOARD_RESPONSE: &str = "agent.OnboardResponse";
    pub const UNINSTALL_REQUEST: &str = "agent.UninstallRequest";
    pub const PING: &str = "agent.Ping";
    pub const START: &str = "agent.Start";
    pub const STOP: &str = "agent.Stop";
    pub const CRASH: &str = "agent.Crash";
    pub const PAUSE: &str = "agent.Pause";
    pub const RESUME: &str = "agent.Resume";
}

/// One integration named in a request, with its provider settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRequest {
    pub name: String,

    /// Source system kind; defaults to the integration name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_type: Option<String>,

    #[serde(default)]
    pub config: Map<String, Value>,
}

impl IntegrationRequest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ref_type(&self) -> &str {
        self.ref_type.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub job_id: String,

    /// Where the finished export is uploaded. Without one the export stays on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,

    #[serde(default)]
    pub reprocess_historical: bool,

    pub integrations: Vec<IntegrationRequest>,
}

/// What one integration exported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationOutcome {
    pub name: String,
    #[serde(default)]
    pub projects: Vec<ExportProject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub integrations: Vec<IntegrationOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub request_id: String,
    pub integration: IntegrationRequest,
    pub action: String,

    /// JSON text handed to the integration as is.
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub mutated_objects: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardRequest {
    pub request_id: String,
    pub integration: IntegrationRequest,
    pub object_type: OnboardObjectType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardResponse {
    pub request_id: String,
    pub object_type: OnboardObjectType,
    pub success: bool,
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentState {
    Idle,
    Exporting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub state: AgentState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    pub version: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Report of a crash left behind by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    pub file_name: String,
    pub data: String,
}

/// An integration paused its requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    pub integration: String,
    pub id: String,
    pub resume_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub integration: String,
    pub id: String,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_export_request_defaults() {
        let request: ExportRequest =
            serde_json::from_str(r#"{"job_id":"j1","integrations":[{"name":"mock","config":{"repos":["a/b"]}}]}"#).unwrap();
        assert_eq!(request.upload_url, None);
        assert!(!request.reprocess_historical);
        assert_eq!(request.integrations[0].ref_type(), "mock");
        assert_eq!(request.integrations[0].config["repos"][0], "a/b");
    }

    #[test]
    fn test_ref_type_override() {
        let integration = IntegrationRequest {
            ref_type: Some("github".into()),
            ..IntegrationRequest::new("github-enterprise")
        };
        assert_eq!(integration.ref_type(), "github");
    }

    #[test]
    fn test_agent_state_names() {
        assert_eq!(AgentState::Exporting.to_string(), "exporting");
        assert_eq!(serde_json::to_string(&AgentState::Idle).unwrap(), "\"idle\"");
    }
}
