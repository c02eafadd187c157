//! Built-in integration serving generated data.
//!
//! It drives the full export machinery (sessions, paginator, retry client, fan-out, the
//! agent delegate) without talking to a real provider, and backs the service self-test.
//!
//! Settings come from the integration config:
//!
//! | key               | meaning                                              | default            |
//! |-------------------|------------------------------------------------------|--------------------|
//! | `repos`           | repository names                                     | `["acme/widgets"]` |
//! | `pull_requests`   | pull requests per repository, one per day            | `3`                |
//! | `start`           | last-updated time of pull request 1                  | `2020-01-01`       |
//! | `page_size`       | items per page                                       | `2`                |
//! | `fail_commits_of` | pull request number whose commits cannot be fetched  | none               |
//! | `panic`           | crash the worker during export                       | `false`            |

use super::contract::{
    AgentDelegate, ExportConfig, ExportProject, ExportResult, GitRepoFetch, Integration, MUTATE_ERROR_NOT_FOUND, MutateResult,
    OnboardExportResult, OnboardObjectType,
};
use crate::Result;
use crate::export::{
    LastProcessedStore, PullRequest, PullRequestComment, PullRequestCommit, PullRequestReview, PullRequestSource, Repo, SessionManager,
    User, UserSender, entity, export_pull_requests_for_repo,
};
use crate::ids::IdGenerator;
use crate::request::{ApiResult, PageInfo, PageParams, RetryClient, is_at_or_before_cutoff, paginate};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use futures::future::BoxFuture;
use ohno::{IntoAppError, app_err, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, OnceLock};

const LOG_TARGET: &str = "      mock";

/// Name the mock integration is registered under.
pub const MOCK_INTEGRATION: &str = "mock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MockConfig {
    repos: Vec<String>,
    pull_requests: u32,
    start: DateTime<Utc>,
    page_size: u32,
    fail_commits_of: Option<u32>,
    panic: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            repos: vec!["acme/widgets".to_string()],
            pull_requests: 3,
            start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            page_size: 2,
            fail_commits_of: None,
            panic: false,
        }
    }
}

impl MockConfig {
    fn parse(config: &ExportConfig) -> Result<Self> {
        serde_json::from_value(Value::Object(config.integration.clone())).into_app_err("parsing mock integration config")
    }
}

/// The built-in mock integration.
#[derive(Default)]
pub struct MockIntegration {
    agent: OnceLock<Arc<dyn AgentDelegate>>,
}

impl core::fmt::Debug for MockIntegration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockIntegration")
            .field("initialized", &self.agent.get().is_some())
            .finish()
    }
}

impl MockIntegration {
    fn agent(&self) -> Result<Arc<dyn AgentDelegate>> {
        self.agent
            .get()
            .cloned()
            .ok_or_else(|| app_err!("mock integration used before init"))
    }

    async fn run_export(&self, config: ExportConfig) -> Result<ExportResult> {
        let mock = MockConfig::parse(&config)?;
        if mock.panic {
            crash();
        }

        let agent = self.agent()?;
        let ids = IdGenerator::new(&config.customer_id, &config.ref_type);
        let store = Arc::new(LastProcessedStore::open(config.state_file.clone())?);
        let sessions = SessionManager::new(store, config.uploads_dir.clone(), &config.integration_name, config.reprocess_historical);
        let retry = Arc::new(RetryClient::new(config.retry.clone(), Arc::clone(&agent)));
        let source = Arc::new(MockSource {
            config: mock.clone(),
            retry: Arc::clone(&retry),
        });

        let repos = source.list_repos(&ids).await?;

        let users = UserSender::new(sessions.open_non_incremental(entity::USER)?);
        let repo_session = sessions.open_non_incremental(entity::REPO)?;
        let sent: Result<()> = repos.iter().try_for_each(|repo| repo_session.send(repo));
        let sent = sent.and_then(|()| {
            for n in 1..=mock.pull_requests {
                let user = mock_user(&ids, n);
                let _ = users.send(&user.ref_id, &user)?;
            }
            Ok(())
        });
        if sent.is_err() {
            repo_session.mark_failed();
        }
        let closed = repo_session.done().and(users.done());
        sent?;
        closed?;

        let mut projects = Vec::with_capacity(repos.len());
        for repo in repos {
            let mut project = ExportProject {
                id: repo.id.clone(),
                ref_id: repo.ref_id.clone(),
                readable_id: repo.name.clone(),
                error: None,
            };

            let fetch = GitRepoFetch {
                ref_type: config.ref_type.clone(),
                repo_id: repo.id.clone(),
                url: repo.url.clone(),
                branch_url_template: format!("{}/tree/@@@branch@@@", repo.url),
                commit_url_template: format!("{}/commit/@@@sha@@@", repo.url),
                prs: Vec::new(),
            };

            match export_pull_requests_for_repo(Arc::clone(&source), &sessions, &ids, repo, config.fanout_buffer).await {
                Ok(prs) => {
                    agent.export_git_repo(GitRepoFetch { prs, ..fetch }).await?;
                }
                Err(e) => {
                    log::error!(target: LOG_TARGET, "Could not export pull requests of '{}': {e:#}", project.readable_id);
                    project.error = Some(format!("{e:#}"));
                }
            }
            projects.push(project);
        }

        Ok(ExportResult { projects })
    }
}

impl Integration for MockIntegration {
    fn init(&self, agent: Arc<dyn AgentDelegate>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.agent.set(agent).is_err() {
                bail!("mock integration initialized twice");
            }
            Ok(())
        })
    }

    fn export(&self, config: ExportConfig) -> BoxFuture<'_, Result<ExportResult>> {
        Box::pin(self.run_export(config))
    }

    fn mutate(&self, action: String, data: String, _config: ExportConfig) -> BoxFuture<'_, Result<MutateResult>> {
        Box::pin(async move {
            let payload: Value = serde_json::from_str(&data).into_app_err("parsing mutation payload")?;
            match action.as_str() {
                "echo" => {
                    let mut result = MutateResult::default();
                    let _ = result.mutated_objects.insert("mock.Echo".to_string(), vec![payload]);
                    Ok(result)
                }
                "missing" => Ok(MutateResult {
                    error: Some("object does not exist".to_string()),
                    error_code: Some(MUTATE_ERROR_NOT_FOUND.to_string()),
                    ..MutateResult::default()
                }),
                _ => bail!("unsupported mutation '{action}'"),
            }
        })
    }

    fn onboard_export(&self, object_type: OnboardObjectType, config: ExportConfig) -> BoxFuture<'_, Result<OnboardExportResult>> {
        Box::pin(async move {
            let mock = MockConfig::parse(&config)?;
            let ids = IdGenerator::new(&config.customer_id, &config.ref_type);

            let records = match object_type {
                OnboardObjectType::Users => (1..=mock.pull_requests)
                    .map(|n| serde_json::to_value(mock_user(&ids, n)))
                    .collect::<Result<Vec<_>, _>>()
                    .into_app_err("encoding users")?,
                OnboardObjectType::Repos => mock
                    .repos
                    .iter()
                    .map(|name| json!({ "id": ids.repo(name), "ref_id": name, "name": name, "active": true }))
                    .collect(),
                OnboardObjectType::Projects | OnboardObjectType::WorkConfig => {
                    return Ok(OnboardExportResult {
                        records: Vec::new(),
                        error: Some(format!("{object_type} is not supported by the mock integration")),
                    });
                }
            };

            Ok(OnboardExportResult { records, error: None })
        })
    }
}

#[expect(clippy::panic, reason = "exercises crash detection in the agent")]
fn crash() -> ! {
    panic!("mock integration asked to crash")
}

fn mock_user(ids: &IdGenerator, n: u32) -> User {
    let ref_id = format!("user-{n}");
    User {
        id: ids.code_user(&ref_id),
        ref_id,
        ref_type: ids.ref_type().to_string(),
        customer_id: ids.customer_id().to_string(),
        name: format!("User {n}"),
        username: format!("user{n}"),
        email: Some(format!("user{n}@example.com")),
    }
}

/// Generated provider data, served through the retry client like real api calls.
#[derive(Debug)]
struct MockSource {
    config: MockConfig,
    retry: Arc<RetryClient>,
}

impl MockSource {
    async fn list_repos(&self, ids: &IdGenerator) -> Result<Vec<Repo>> {
        let collected = Mutex::new(Vec::new());
        let page_size = self.config.page_size.max(1) as usize;

        paginate(|params| {
            let collected = &collected;
            async move {
                let start = (params.page as usize - 1) * page_size;
                let names: Vec<String> = self
                    .retry
                    .call(|| {
                        let page = self.config.repos.iter().skip(start).take(page_size).cloned().collect();
                        async move { ApiResult::Success(page) }
                    })
                    .await?;

                let more = start + page_size < self.config.repos.len();
                collected.lock().expect("lock not poisoned").extend(names.into_iter().map(|name| Repo {
                    id: ids.repo(&name),
                    ref_id: name.clone(),
                    ref_type: ids.ref_type().to_string(),
                    customer_id: ids.customer_id().to_string(),
                    url: format!("https://example.com/{name}"),
                    default_branch: "main".to_string(),
                    name,
                    updated_at: None,
                }));

                Ok(if more { PageInfo::more() } else { PageInfo::last() })
            }
        })
        .await?;

        Ok(collected.into_inner().expect("lock not poisoned"))
    }

    fn pull_request(&self, repo: &Repo, n: u32) -> PullRequest {
        let updated_at = self.config.start + TimeDelta::days(i64::from(n) - 1);
        PullRequest {
            ref_id: n.to_string(),
            identifier: format!("#{n}"),
            title: format!("Change {n}"),
            url: format!("{}/pull/{n}", repo.url),
            status: "open".to_string(),
            branch_name: format!("feature-{n}"),
            created_at: Some(updated_at - TimeDelta::hours(1)),
            updated_at: Some(updated_at),
            created_by_ref_id: format!("user-{n}"),
            ..PullRequest::default()
        }
    }

    fn number(pr: &PullRequest) -> u32 {
        pr.ref_id.parse().unwrap_or_default()
    }
}

impl PullRequestSource for MockSource {
    fn pull_requests<'a>(
        &'a self,
        repo: &'a Repo,
        params: PageParams,
        cutoff: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(PageInfo, Vec<PullRequest>)>> {
        Box::pin(async move {
            let page_size = self.config.page_size.max(1);
            let skip = (params.page - 1) * page_size;
            let newest = self.config.pull_requests.saturating_sub(skip);
            let oldest = newest.saturating_sub(page_size - 1).max(1);

            let page: Vec<PullRequest> = self
                .retry
                .call(|| {
                    let page = if newest == 0 {
                        Vec::new()
                    } else {
                        (oldest..=newest).rev().map(|n| self.pull_request(repo, n)).collect()
                    };
                    async move { ApiResult::Success(page) }
                })
                .await?;

            let reached_cutoff = page
                .iter()
                .any(|pr| pr.updated_at.is_some_and(|t| is_at_or_before_cutoff(t, cutoff)));
            let info = if oldest > 1 && newest > 0 { PageInfo::more() } else { PageInfo::last() };

            Ok((
                PageInfo {
                    reached_cutoff,
                    ..info.with_total(u64::from(self.config.pull_requests))
                },
                page,
            ))
        })
    }

    fn comments<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestComment>>> {
        Box::pin(async move {
            let comment = PullRequestComment {
                ref_id: format!("{}-comment", pr.ref_id),
                body: format!("Comment on {}", pr.identifier),
                url: format!("{}/pull/{}#comment", repo.url, pr.ref_id),
                created_at: pr.updated_at,
                updated_at: pr.updated_at,
                user_ref_id: pr.created_by_ref_id.clone(),
                ..PullRequestComment::default()
            };
            self.retry.call(|| {
                let comments = vec![comment.clone()];
                async move { ApiResult::Success(comments) }
            })
            .await
        })
    }

    fn reviews<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestReview>>> {
        Box::pin(async move {
            // Every other pull request is reviewed.
            if Self::number(pr) % 2 != 0 {
                return Ok(Vec::new());
            }

            let review = PullRequestReview {
                ref_id: format!("{}-review", pr.ref_id),
                state: "approved".to_string(),
                url: format!("{}/pull/{}#review", repo.url, pr.ref_id),
                created_at: pr.updated_at,
                user_ref_id: "user-1".to_string(),
                ..PullRequestReview::default()
            };
            self.retry.call(|| {
                let reviews = vec![review.clone()];
                async move { ApiResult::Success(reviews) }
            })
            .await
        })
    }

    fn commits<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestCommit>>> {
        Box::pin(async move {
            let n = Self::number(pr);
            if self.config.fail_commits_of == Some(n) {
                return self
                    .retry
                    .call(|| async move { ApiResult::Failed(app_err!("commits of pull request {n} are unavailable")) })
                    .await;
            }

            // Pull requests numbered by a multiple of three have no commits.
            let count = n % 3;
            let commits = (1..=count)
                .rev()
                .map(|i| PullRequestCommit {
                    sha: format!("{:040x}", u64::from(n) * 1000 + u64::from(i)),
                    message: format!("Commit {i} of {}", pr.identifier),
                    url: format!("{}/commit/{i}", repo.url),
                    author_email: format!("{}@example.com", pr.created_by_ref_id),
                    author_ref_id: pr.created_by_ref_id.clone(),
                    created_at: pr.updated_at,
                    ..PullRequestCommit::default()
                })
                .collect::<Vec<_>>();

            self.retry.call(|| {
                let commits = commits.clone();
                async move { ApiResult::Success(commits) }
            })
            .await
        })
    }
}
