//! Deterministic, content-addressed identifiers.
//!
//! Records fetched independently (a pull request from one API call, its commits from
//! another, the repository's history from a local clone) must reference each other
//! without any shared storage. Every identifier is therefore a pure function of the
//! customer scope, the integration's ref type, and the record's natural keys.
//!
//! A missing natural key yields an empty string. Callers treat an empty identifier as
//! "unset", never as a valid reference.

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in an identifier (hex encoded, so twice as many chars).
const ID_BYTES: usize = 16;

const KIND_REPO: &str = "sourcecode.Repo";
const KIND_CODE_USER: &str = "sourcecode.User";
const KIND_COMMIT: &str = "sourcecode.Commit";
const KIND_COMMIT_EMAIL: &str = "sourcecode.CommitEmail";
const KIND_PULL_REQUEST: &str = "sourcecode.PullRequest";
const KIND_PULL_REQUEST_COMMENT: &str = "sourcecode.PullRequestComment";
const KIND_PULL_REQUEST_REVIEW: &str = "sourcecode.PullRequestReview";
const KIND_BRANCH: &str = "sourcecode.Branch";
const KIND_PROJECT: &str = "work.Project";
const KIND_ISSUE: &str = "work.Issue";
const KIND_WORK_USER: &str = "work.User";
const KIND_SPRINT: &str = "work.Sprint";
const KIND_USER_ASSOCIATION: &str = "work.UserAssociation";

/// Generates identifiers for one customer and one integration ref type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdGenerator {
    customer_id: String,
    ref_type: String,
}

impl IdGenerator {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, ref_type: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ref_type: ref_type.into(),
        }
    }

    #[must_use]
    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    #[must_use]
    pub fn ref_type(&self) -> &str {
        &self.ref_type
    }

    #[must_use]
    pub fn repo(&self, ref_id: &str) -> String {
        self.scoped(KIND_REPO, &[ref_id])
    }

    #[must_use]
    pub fn code_user(&self, ref_id: &str) -> String {
        self.scoped(KIND_CODE_USER, &[ref_id])
    }

    /// Identifier for a commit author or committer known only by email.
    ///
    /// Emails are global across integrations, so the ref type is not part of the key.
    #[must_use]
    pub fn commit_email(&self, email: &str) -> String {
        if email.is_empty() {
            return String::new();
        }
        hash_values(&[KIND_COMMIT_EMAIL, &self.customer_id, email])
    }

    #[must_use]
    pub fn commit(&self, repo_id: &str, sha: &str) -> String {
        self.scoped(KIND_COMMIT, &[repo_id, sha])
    }

    /// Maps commit SHAs to commit identifiers, preserving order.
    ///
    /// Returns an empty list when `repo_id` is empty.
    #[must_use]
    pub fn commits<S: AsRef<str>>(&self, repo_id: &str, shas: &[S]) -> Vec<String> {
        if repo_id.is_empty() {
            return Vec::new();
        }
        shas.iter().map(|sha| self.commit(repo_id, sha.as_ref())).collect()
    }

    #[must_use]
    pub fn pull_request(&self, repo_id: &str, ref_id: &str) -> String {
        self.scoped(KIND_PULL_REQUEST, &[repo_id, ref_id])
    }

    #[must_use]
    pub fn pull_request_comment(&self, repo_id: &str, ref_id: &str) -> String {
        self.scoped(KIND_PULL_REQUEST_COMMENT, &[repo_id, ref_id])
    }

    #[must_use]
    pub fn pull_request_review(&self, repo_id: &str, ref_id: &str) -> String {
        self.scoped(KIND_PULL_REQUEST_REVIEW, &[repo_id, ref_id])
    }

    /// Branch identity is tied to the branch's first commit, so rewriting the history
    /// of a branch under the same name produces a new branch identifier.
    #[must_use]
    pub fn branch(&self, repo_id: &str, branch_name: &str, first_commit_sha: &str) -> String {
        if repo_id.is_empty() || branch_name.is_empty() || first_commit_sha.is_empty() {
            return String::new();
        }
        let first_commit_id = self.commit(repo_id, first_commit_sha);
        self.scoped(KIND_BRANCH, &[repo_id, branch_name, &first_commit_id])
    }

    #[must_use]
    pub fn work_project(&self, ref_id: &str) -> String {
        self.scoped(KIND_PROJECT, &[ref_id])
    }

    #[must_use]
    pub fn work_issue(&self, ref_id: &str) -> String {
        self.scoped(KIND_ISSUE, &[ref_id])
    }

    #[must_use]
    pub fn work_user(&self, ref_id: &str) -> String {
        self.scoped(KIND_WORK_USER, &[ref_id])
    }

    #[must_use]
    pub fn work_sprint(&self, ref_id: &str) -> String {
        self.scoped(KIND_SPRINT, &[ref_id])
    }

    /// Identifier for a user referenced by an external ref (e.g. an account id found on
    /// an issue) before the user record itself has been fetched.
    #[must_use]
    pub fn user_association(&self, associated_ref_id: &str) -> String {
        self.scoped(KIND_USER_ASSOCIATION, &[associated_ref_id])
    }

    /// Hash `keys` under the customer and ref type scope; empty if any key is empty.
    fn scoped(&self, kind: &str, keys: &[&str]) -> String {
        if keys.iter().any(|k| k.is_empty()) {
            return String::new();
        }

        let mut parts = Vec::with_capacity(keys.len() + 3);
        parts.push(kind);
        parts.push(self.customer_id.as_str());
        parts.push(self.ref_type.as_str());
        parts.extend_from_slice(keys);
        hash_values(&parts)
    }
}

/// Hash a list of values into a hex string.
///
/// Each value is length-prefixed so that `["ab", "c"]` and `["a", "bc"]` differ.
fn hash_values(values: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    hex::encode(&hasher.finalize()[..ID_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdGenerator {
        IdGenerator::new("customer-1", "github")
    }

    #[test]
    fn test_commit_id_is_stable() {
        let a = ids().commit("repo-1", "abc123");
        let b = IdGenerator::new("customer-1", "github").commit("repo-1", "abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_known_values_do_not_drift() {
        // Identifiers are persisted downstream and must never change between releases.
        let g = ids();
        assert_eq!(g.commit("repo-1", "abc123"), "aec0b1f47c5f29c37232acb73364bd07");
        assert_eq!(g.branch("repo-1", "main", "abc123"), "7002eb206f69e8b836d58bbac952bcf2");
        assert_eq!(g.user_association("acct-7"), "a32e20ce60ac434611bc374c7cef3763");
        assert_eq!(g.commit_email("dev@example.com"), "ec019d2a68549cb6d8601f193a690e5a");
    }

    #[test]
    fn test_values_are_length_prefixed() {
        let id = hash_values(&["a", "b"]);
        assert_ne!(id, hash_values(&["ab"]));
        assert_ne!(id, hash_values(&["a", "b", ""]));
    }

    #[test]
    fn test_missing_keys_yield_empty() {
        let g = ids();
        assert_eq!(g.commit("", "abc"), "");
        assert_eq!(g.commit("repo", ""), "");
        assert_eq!(g.pull_request("", "1"), "");
        assert_eq!(g.pull_request("repo", ""), "");
        assert_eq!(g.branch("repo", "main", ""), "");
        assert_eq!(g.branch("repo", "", "abc"), "");
        assert_eq!(g.user_association(""), "");
        assert_eq!(g.commit_email(""), "");
        assert_eq!(g.repo(""), "");
    }

    #[test]
    fn test_scope_changes_identity() {
        let a = IdGenerator::new("customer-1", "github").repo("42");
        let b = IdGenerator::new("customer-2", "github").repo("42");
        let c = IdGenerator::new("customer-1", "gitlab").repo("42");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let g = ids();
        assert_ne!(g.repo("42"), g.code_user("42"));
        assert_ne!(g.work_issue("42"), g.work_project("42"));
        assert_ne!(g.work_user("42"), g.user_association("42"));
        assert_ne!(g.pull_request("r", "42"), g.pull_request_comment("r", "42"));
        assert_ne!(g.pull_request_comment("r", "42"), g.pull_request_review("r", "42"));
    }

    #[test]
    fn test_branch_tied_to_first_commit() {
        let g = ids();
        let before = g.branch("repo", "feature", "sha-1");
        let rewritten = g.branch("repo", "feature", "sha-9");
        assert_ne!(before, rewritten);
        assert_eq!(before, g.branch("repo", "feature", "sha-1"));
    }

    #[test]
    fn test_commits_preserves_order() {
        let g = ids();
        let res = g.commits("repo", &["a", "b"]);
        assert_eq!(res, vec![g.commit("repo", "a"), g.commit("repo", "b")]);
        assert!(g.commits("", &["a"]).is_empty());
    }

    #[test]
    fn test_commit_email_ignores_ref_type() {
        let a = IdGenerator::new("c", "github").commit_email("dev@example.com");
        let b = IdGenerator::new("c", "gitlab").commit_email("dev@example.com");
        assert_eq!(a, b);
    }
}
