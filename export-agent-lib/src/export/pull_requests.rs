//! Export of one repository's pull requests with their comments, reviews and commits.
//!
//! Pull requests are paged newest-updated first and stop at the cursor left by the
//! previous run. Each page goes to three stages:
//!
//! - comments, written to their own session,
//! - reviews, written to one child session per pull request,
//! - commits, which resolve commit SHAs and the branch id and then write the pull
//!   request itself together with its commits.
//!
//! The commits stage also collects the linkage the agent needs to export the
//! repository's branches.

use super::fanout::FanOut;
use super::model::{PullRequest, PullRequestComment, PullRequestCommit, PullRequestReview, Repo, entity};
use super::session::{ParentRef, Session, SessionManager};
use crate::Result;
use crate::ids::IdGenerator;
use crate::plugin::GitRepoFetchPr;
use crate::request::{PageInfo, PageParams, is_at_or_before_cutoff, paginate_newer_than};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;

const LOG_TARGET: &str = "       prs";

/// Provider-specific fetches behind a pull request export.
pub trait PullRequestSource: Send + Sync {
    /// One page of the repository's pull requests, most recently updated first.
    ///
    /// Implementations may stop early once they return an item updated at or before
    /// `cutoff`; items that old are dropped by the caller either way.
    fn pull_requests<'a>(
        &'a self,
        repo: &'a Repo,
        params: PageParams,
        cutoff: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(PageInfo, Vec<PullRequest>)>>;

    fn comments<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestComment>>>;

    fn reviews<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestReview>>>;

    /// All commits of a pull request, newest first.
    fn commits<'a>(&'a self, repo: &'a Repo, pr: &'a PullRequest) -> BoxFuture<'a, Result<Vec<PullRequestCommit>>>;
}

/// Export the pull requests of `repo` changed since the previous run.
///
/// Returns the linkage of every written pull request that has commits.
pub async fn export_pull_requests_for_repo<S>(
    source: Arc<S>,
    sessions: &Arc<SessionManager>,
    ids: &IdGenerator,
    repo: Repo,
    fanout_buffer: usize,
) -> Result<Vec<GitRepoFetchPr>>
where
    S: PullRequestSource + ?Sized + 'static,
{
    let parent = ParentRef::new(entity::REPO, &repo.id);
    let prs = Arc::new(sessions.open_child(entity::PULL_REQUEST, parent.clone())?);
    let commits = Arc::new(
        sessions
            .open_child(entity::PULL_REQUEST_COMMIT, parent.clone())
            .inspect_err(|_| close_all(&[&*prs], true))?,
    );
    let comments = Arc::new(
        sessions
            .open_child(entity::PULL_REQUEST_COMMENT, parent)
            .inspect_err(|_| close_all(&[&*prs, &*commits], true))?,
    );

    let repo = Arc::new(repo);
    let cutoff = prs.last_processed_time();
    log::info!(target: LOG_TARGET, "Exporting pull requests of '{}' updated after {cutoff:?}", repo.name);

    let mut fan: FanOut<PullRequest, GitRepoFetchPr> = FanOut::new(format!("pull requests of '{}'", repo.name), fanout_buffer);

    {
        let source = Arc::clone(&source);
        let repo = Arc::clone(&repo);
        let session = Arc::clone(&comments);
        let ids = ids.clone();
        fan.stage("comments", move |mut input| async move {
            while let Some(page) = input.next().await {
                for pr in page.iter() {
                    if input.is_aborted() {
                        return Ok(());
                    }
                    for mut comment in source.comments(&repo, pr).await? {
                        comment.id = ids.pull_request_comment(&repo.id, &comment.ref_id);
                        comment.ref_type = ids.ref_type().to_string();
                        comment.customer_id = ids.customer_id().to_string();
                        comment.repo_id.clone_from(&repo.id);
                        comment.pull_request_id.clone_from(&pr.id);
                        session.send(&comment)?;
                    }
                }
            }
            Ok(())
        });
    }

    {
        let source = Arc::clone(&source);
        let repo = Arc::clone(&repo);
        let sessions = Arc::clone(sessions);
        let ids = ids.clone();
        fan.stage("reviews", move |mut input| async move {
            while let Some(page) = input.next().await {
                for pr in page.iter() {
                    if input.is_aborted() {
                        return Ok(());
                    }
                    let reviews = source.reviews(&repo, pr).await?;
                    if reviews.is_empty() {
                        continue;
                    }

                    let session = sessions.open_child(entity::PULL_REQUEST_REVIEW, ParentRef::new(entity::PULL_REQUEST, &pr.id))?;
                    let sent = reviews.into_iter().try_for_each(|mut review| {
                        review.id = ids.pull_request_review(&repo.id, &review.ref_id);
                        review.ref_type = ids.ref_type().to_string();
                        review.customer_id = ids.customer_id().to_string();
                        review.repo_id.clone_from(&repo.id);
                        review.pull_request_id.clone_from(&pr.id);
                        session.send(&review)
                    });
                    close_all(&[&session], sent.is_err());
                    sent?;
                }
            }
            Ok(())
        });
    }

    {
        let source = Arc::clone(&source);
        let repo = Arc::clone(&repo);
        let pr_session = Arc::clone(&prs);
        let commit_session = Arc::clone(&commits);
        let side = fan.side_output();
        let ids = ids.clone();
        fan.stage("commits", move |mut input| async move {
            while let Some(page) = input.next().await {
                for pr in page.iter() {
                    if input.is_aborted() {
                        return Ok(());
                    }

                    let mut pr = pr.clone();
                    let mut pr_commits = source.commits(&repo, &pr).await?;

                    let Some(last_commit_sha) = pr_commits.first().map(|c| c.sha.clone()) else {
                        log::info!(target: LOG_TARGET, "Pull request {} of '{}' has no commits", pr.identifier, repo.name);
                        pr_session.send(&pr)?;
                        continue;
                    };

                    pr_commits.reverse();
                    pr.commit_shas = pr_commits.iter().map(|c| c.sha.clone()).collect();
                    pr.commit_ids = ids.commits(&repo.id, &pr.commit_shas);
                    let first_sha = pr.commit_shas.first().map_or("", String::as_str);
                    pr.branch_id = ids.branch(&repo.id, &pr.branch_name, first_sha);

                    side.push(GitRepoFetchPr {
                        id: pr.id.clone(),
                        ref_id: pr.ref_id.clone(),
                        url: pr.url.clone(),
                        branch_name: pr.branch_name.clone(),
                        last_commit_sha,
                    });

                    pr_session.send(&pr)?;

                    for mut commit in pr_commits {
                        commit.id = ids.commit(&repo.id, &commit.sha);
                        commit.ref_type = ids.ref_type().to_string();
                        commit.customer_id = ids.customer_id().to_string();
                        commit.repo_id.clone_from(&repo.id);
                        commit.pull_request_id.clone_from(&pr.id);
                        commit.branch_id.clone_from(&pr.branch_id);
                        commit_session.send(&commit)?;
                    }
                }
            }
            Ok(())
        });
    }

    let outcome = fan
        .run(|publisher| {
            let source = &source;
            let repo = &repo;
            let session = &prs;
            async move {
                let publisher = &publisher;
                paginate_newer_than(cutoff, move |params, cutoff| async move {
                    let (mut info, mut page) = source.pull_requests(repo, params, cutoff).await?;

                    let fetched = page.len();
                    page.retain(|pr| !pr.updated_at.is_some_and(|t| is_at_or_before_cutoff(t, cutoff)));
                    if page.len() < fetched {
                        info.reached_cutoff = true;
                    }

                    if let Some(total) = info.total {
                        session.set_total(total);
                    }

                    for pr in &mut page {
                        pr.id = ids.pull_request(&repo.id, &pr.ref_id);
                        pr.ref_type = ids.ref_type().to_string();
                        pr.customer_id = ids.customer_id().to_string();
                        pr.repo_id.clone_from(&repo.id);
                        if let Some(updated_at) = pr.updated_at {
                            session.advance_time(updated_at);
                        }
                    }

                    if !page.is_empty() {
                        publisher.publish(page).await?;
                    }
                    Ok(info)
                })
                .await
            }
        })
        .await;

    close_all(&[&*prs, &*commits, &*comments], outcome.error.is_some());

    let linked = outcome.into_result()?;
    log::info!(
        target: LOG_TARGET,
        "Exported {} pull request(s) of '{}', {} with commits",
        prs.count(),
        repo.name,
        linked.len()
    );
    Ok(linked)
}

/// Complete sessions, keeping their stored cursors when `failed`.
///
/// Close failures are logged and do not change the outcome of the export.
fn close_all(sessions: &[&Session], failed: bool) {
    for session in sessions {
        if failed {
            session.mark_failed();
        }
        if let Err(e) = session.done() {
            log::warn!(target: LOG_TARGET, "Could not complete session '{}': {e:#}", session.entity_type());
        }
    }
}
