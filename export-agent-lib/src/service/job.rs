//! Running integrations on behalf of a job.

use super::events::{Event, EventBus, EventHeaders};
use super::exporter::ExportPipeline;
use super::messages::{ExportRequest, IntegrationOutcome, IntegrationRequest, Pause, Resume, topic};
use crate::Result;
use crate::config::{AgentConfig, Locations};
use crate::plugin::{AgentDelegate, ExportConfig, GitRepoFetch, Integration, IntegrationProcess, WorkerCommand};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use core::fmt;
use futures::future::BoxFuture;
use ohno::{EnrichableExt, IntoAppError, app_err};
use std::fs;
use std::sync::{Arc, Mutex};

const LOG_TARGET: &str = "       job";

/// Produces the command serving a named integration.
pub type CommandFactory = Arc<dyn Fn(&str) -> Result<WorkerCommand> + Send + Sync>;

/// Starts integration workers and builds their configuration.
#[derive(Clone)]
pub struct Integrations {
    config: Arc<AgentConfig>,
    locations: Locations,
    command: CommandFactory,
}

impl fmt::Debug for Integrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrations")
            .field("config", &self.config)
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

impl Integrations {
    /// Integrations are served by the configured executable, or by the agent itself.
    #[must_use]
    pub fn new(config: Arc<AgentConfig>, locations: Locations) -> Self {
        let exe = config.integration_command.clone();
        Self {
            config,
            locations,
            command: Arc::new(move |name: &str| WorkerCommand::builtin(exe.as_deref(), name)),
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: CommandFactory) -> Self {
        self.command = command;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub const fn locations(&self) -> &Locations {
        &self.locations
    }

    /// Configuration handed to `integration` for one operation.
    #[must_use]
    pub fn export_config(&self, integration: &IntegrationRequest, reprocess_historical: bool) -> ExportConfig {
        ExportConfig {
            customer_id: self.config.customer_id.clone(),
            integration_name: integration.name.clone(),
            ref_type: integration.ref_type().to_string(),
            integration: integration.config.clone(),
            uploads_dir: self.locations.uploads_dir(),
            state_file: self.locations.state_file(),
            reprocess_historical,
            retry: self.config.retry_policy(),
            fanout_buffer: self.config.fanout_buffer,
        }
    }

    /// Start the worker for `name`, run `op` against it, then shut it down.
    ///
    /// A crash report found in the worker's log is attached to the error.
    pub async fn run<T, F>(&self, name: &str, delegate: Arc<dyn AgentDelegate>, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a dyn Integration) -> BoxFuture<'a, Result<T>>,
    {
        let command = (self.command)(name)?;
        let mut process = IntegrationProcess::start(name, &command, &self.locations.logs_dir(), delegate).await?;

        let result = op(process.integration()).await;

        let (panic, closed) = process.close_and_detect_panic().await;
        if let Err(e) = closed {
            log::warn!(target: LOG_TARGET, "Could not close integration '{name}' cleanly: {e:#}");
        }

        match (result, panic) {
            (Err(e), Some(panic)) => Err(e.enrich_with(|| format!("integration '{name}' crashed: {panic}"))),
            (Err(e), None) => Err(e),
            (Ok(value), panic) => {
                if let Some(panic) = panic {
                    log::warn!(target: LOG_TARGET, "Integration '{name}' logged a crash after finishing: {panic}");
                }
                Ok(value)
            }
        }
    }
}

/// Agent side of the delegate handed to an integration during one job.
pub struct JobDelegate {
    integration: String,
    job_id: String,
    repos: Mutex<Vec<GitRepoFetch>>,
    bus: Arc<dyn EventBus>,
    headers: EventHeaders,
}

impl fmt::Debug for JobDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDelegate")
            .field("integration", &self.integration)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl JobDelegate {
    #[must_use]
    pub fn new(integration: &str, job_id: &str, bus: Arc<dyn EventBus>, headers: EventHeaders) -> Arc<Self> {
        Arc::new(Self {
            integration: integration.to_string(),
            job_id: job_id.to_string(),
            repos: Mutex::new(Vec::new()),
            bus,
            headers,
        })
    }

    /// Repository export requests received so far.
    pub fn take_repos(&self) -> Vec<GitRepoFetch> {
        core::mem::take(&mut *self.repos.lock().expect("lock not poisoned"))
    }

    async fn notify(&self, topic: &str, payload: &impl serde::Serialize) -> Result<()> {
        let event = Event::new(topic, payload)?;
        self.bus.publish(self.headers.apply(event, Some(&self.job_id))).await
    }
}

impl AgentDelegate for JobDelegate {
    fn export_git_repo(&self, fetch: GitRepoFetch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::debug!(target: LOG_TARGET, "Integration '{}' requested export of repo '{}'", self.integration, fetch.url);
            self.repos.lock().expect("lock not poisoned").push(fetch);
            Ok(())
        })
    }

    fn send_pause_event(&self, id: String, resume_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!(target: LOG_TARGET, "Integration '{}' paused until {resume_at}", self.integration);
            let pause = Pause {
                integration: self.integration.clone(),
                id,
                resume_at,
            };
            self.notify(topic::PAUSE, &pause).await
        })
    }

    fn send_resume_event(&self, id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!(target: LOG_TARGET, "Integration '{}' resumed", self.integration);
            let resume = Resume {
                integration: self.integration.clone(),
                id,
            };
            self.notify(topic::RESUME, &resume).await
        })
    }
}

/// Exports the source repositories integrations asked for.
pub trait RepoExporter: Send + Sync {
    fn export_repos<'a>(&'a self, integration: &'a str, repos: Vec<GitRepoFetch>) -> BoxFuture<'a, Result<()>>;
}

/// Records repository requests as `git/<integration>.json` in the export.
///
/// Cloning and history extraction happen on the backend.
#[derive(Debug, Clone)]
pub struct ManifestRepoExporter {
    uploads_dir: Utf8PathBuf,
}

impl ManifestRepoExporter {
    #[must_use]
    pub fn new(uploads_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
        }
    }

    #[must_use]
    pub fn manifest_path(&self, integration: &str) -> Utf8PathBuf {
        self.uploads_dir.join("git").join(format!("{integration}.json"))
    }
}

impl RepoExporter for ManifestRepoExporter {
    fn export_repos<'a>(&'a self, integration: &'a str, repos: Vec<GitRepoFetch>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.manifest_path(integration);
            write_json(&path, &repos)?;
            log::info!(target: LOG_TARGET, "Recorded {} repositories for '{integration}' in '{path}'", repos.len());
            Ok(())
        })
    }
}

/// Runs each integration of a job in its own worker process, one after another.
#[derive(Clone)]
pub struct PluginExportPipeline {
    integrations: Integrations,
    repo_exporter: Arc<dyn RepoExporter>,
    bus: Arc<dyn EventBus>,
    headers: EventHeaders,
}

impl fmt::Debug for PluginExportPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginExportPipeline")
            .field("integrations", &self.integrations)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl PluginExportPipeline {
    #[must_use]
    pub fn new(integrations: Integrations, repo_exporter: Arc<dyn RepoExporter>, bus: Arc<dyn EventBus>, headers: EventHeaders) -> Self {
        Self {
            integrations,
            repo_exporter,
            bus,
            headers,
        }
    }

    async fn export_one(&self, request: &ExportRequest, integration: &IntegrationRequest, config_dir: &Utf8Path) -> Result<IntegrationOutcome> {
        let name = &integration.name;
        let config = self.integrations.export_config(integration, request.reprocess_historical);
        write_json(&config_dir.join(format!("{name}.json")), &config)?;

        let delegate = JobDelegate::new(name, &request.job_id, Arc::clone(&self.bus), self.headers.clone());
        let result = self
            .integrations
            .run(name, Arc::clone(&delegate) as Arc<dyn AgentDelegate>, move |i| i.export(config))
            .await?;

        let repos = delegate.take_repos();
        if !repos.is_empty() {
            self.repo_exporter
                .export_repos(name, repos)
                .await
                .map_err(|e| e.enrich_with(|| format!("exporting repositories of '{name}'")))?;
        }

        Ok(IntegrationOutcome {
            name: name.clone(),
            projects: result.projects,
            error: None,
        })
    }
}

impl ExportPipeline for PluginExportPipeline {
    fn run<'a>(&'a self, request: &'a ExportRequest) -> BoxFuture<'a, Result<Vec<IntegrationOutcome>>> {
        Box::pin(async move {
            let config_dir = self.integrations.locations().temp_dir().join(&request.job_id);
            fs::create_dir_all(&config_dir).into_app_err_with(|| format!("creating directory '{config_dir}'"))?;

            let mut outcomes = Vec::with_capacity(request.integrations.len());
            let mut errors = Vec::new();
            for integration in &request.integrations {
                log::info!(target: LOG_TARGET, "Exporting '{}' for job '{}'", integration.name, request.job_id);
                match self.export_one(request, integration, &config_dir).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        let message = format!("{e:#}");
                        log::error!(target: LOG_TARGET, "Export of '{}' failed: {message}", integration.name);
                        errors.push(format!("{}: {message}", integration.name));
                        outcomes.push(IntegrationOutcome {
                            name: integration.name.clone(),
                            projects: Vec::new(),
                            error: Some(message),
                        });
                    }
                }
            }

            if let Err(e) = fs::remove_dir_all(&config_dir) {
                log::warn!(target: LOG_TARGET, "Could not remove '{config_dir}': {e}");
            }

            if errors.is_empty() {
                Ok(outcomes)
            } else {
                Err(app_err!("{}", errors.join("\n")))
            }
        })
    }
}

fn write_json(path: &Utf8Path, value: &impl serde::Serialize) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).into_app_err_with(|| format!("creating directory '{dir}'"))?;
    }
    let json = serde_json::to_vec_pretty(value).into_app_err_with(|| format!("encoding '{path}'"))?;
    fs::write(path, json).into_app_err_with(|| format!("writing '{path}'"))
}
