//! Normalized source-code records emitted by the export layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity type names, used as session names and in the incremental store.
pub mod entity {
    pub const REPO: &str = "sourcecode.Repo";
    pub const USER: &str = "sourcecode.User";
    pub const PULL_REQUEST: &str = "sourcecode.PullRequest";
    pub const PULL_REQUEST_COMMENT: &str = "sourcecode.PullRequestComment";
    pub const PULL_REQUEST_REVIEW: &str = "sourcecode.PullRequestReview";
    pub const PULL_REQUEST_COMMIT: &str = "sourcecode.PullRequestCommit";
    pub const WORK_PROJECT: &str = "work.Project";
    pub const WORK_ISSUE: &str = "work.Issue";
}

/// A repository whose pull requests are being exported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repo {
    pub id: String,
    pub ref_id: String,
    pub ref_type: String,
    pub customer_id: String,

    /// Full name, e.g. `owner/name`.
    pub name: String,
    pub url: String,
    pub default_branch: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A user of the source-code provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub ref_id: String,
    pub ref_type: String,
    pub customer_id: String,
    pub name: String,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequest {
    pub id: String,
    pub ref_id: String,
    pub ref_type: String,
    pub customer_id: String,
    pub repo_id: String,

    /// Number shown to users, e.g. `#42`.
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub status: String,
    pub branch_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_by_ref_id: String,

    /// Filled in by the commits stage, oldest first.
    pub commit_shas: Vec<String>,
    pub commit_ids: Vec<String>,
    pub branch_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestComment {
    pub id: String,
    pub ref_id: String,
    pub ref_type: String,
    pub customer_id: String,
    pub repo_id: String,
    pub pull_request_id: String,
    pub body: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub user_ref_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestReview {
    pub id: String,
    pub ref_id: String,
    pub ref_type: String,
    pub customer_id: String,
    pub repo_id: String,
    pub pull_request_id: String,
    pub state: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub user_ref_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestCommit {
    pub id: String,
    pub sha: String,
    pub ref_type: String,
    pub customer_id: String,
    pub repo_id: String,
    pub pull_request_id: String,
    pub branch_id: String,
    pub message: String,
    pub url: String,
    pub author_email: String,
    pub author_ref_id: String,
    pub committer_email: String,
    pub created_at: Option<DateTime<Utc>>,
}
