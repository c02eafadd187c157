//! The long-running agent service.
//!
//! Consumes requests from the [`EventBus`], runs them, and answers on the matching
//! response topic. Exports go through the [`Exporter`] queue; mutations and onboarding
//! requests each start their own integration worker. The service announces itself with
//! a start event, reports crashes left by earlier runs, pings while it runs, and sends a
//! stop event on the way out.

use super::events::{Event, EventBus, EventHeaders};
use super::exporter::Exporter;
use super::job::{Integrations, JobDelegate};
use super::messages::{
    AgentState, Crash, ExportRequest, ExportResponse, IntegrationRequest, MutationRequest, MutationResponse, OnboardRequest,
    OnboardResponse, Ping, Start, Stop, topic,
};
use crate::Result;
use crate::plugin::{AgentDelegate, MOCK_INTEGRATION, MutateResult, OnboardExportResult};
use camino::Utf8Path;
use chrono::Utc;
use core::fmt;
use core::time::Duration;
use ohno::IntoAppError;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tokio::task::JoinSet;

const LOG_TARGET: &str = "   service";

/// Job id of the export run by the self-test.
pub const SELF_TEST_JOB_ID: &str = "self-test";

/// Serves requests until uninstalled or the event stream ends.
pub struct ServiceRunner {
    shared: Arc<Shared>,
    ping_interval: Duration,
    self_test: bool,
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRunner")
            .field("headers", &self.shared.headers)
            .field("ping_interval", &self.ping_interval)
            .field("self_test", &self.self_test)
            .finish_non_exhaustive()
    }
}

struct Shared {
    integrations: Integrations,
    exporter: Exporter,
    bus: Arc<dyn EventBus>,
    headers: EventHeaders,
}

impl ServiceRunner {
    #[must_use]
    pub fn new(integrations: Integrations, exporter: Exporter, bus: Arc<dyn EventBus>) -> Self {
        let config = integrations.config();
        let headers = EventHeaders::new(&config.customer_id, &config.device_id);
        let ping_interval = config.ping_interval;
        Self {
            shared: Arc::new(Shared {
                integrations,
                exporter,
                bus,
                headers,
            }),
            ping_interval,
            self_test: false,
        }
    }

    /// Also run one export with the built-in mock integration at startup.
    #[must_use]
    pub const fn with_self_test(mut self, self_test: bool) -> Self {
        self.self_test = self_test;
        self
    }

    pub async fn run(self) -> Result<()> {
        let shared = &self.shared;
        let mut exports = shared.bus.subscribe(topic::EXPORT_REQUEST);
        let mut mutations = shared.bus.subscribe(topic::MUTATION_REQUEST);
        let mut onboards = shared.bus.subscribe(topic::ONBOARD_REQUEST);
        let mut uninstalls = shared.bus.subscribe(topic::UNINSTALL_REQUEST);

        let start = Start {
            version: env!("CARGO_PKG_VERSION").to_string(),
            at: Utc::now(),
        };
        shared.publish(topic::START, &start, None).await?;
        shared.send_crash_reports().await;

        let pinger = tokio::spawn(Arc::clone(shared).ping(self.ping_interval));
        let mut handlers = JoinSet::new();

        if self.self_test {
            log::info!(target: LOG_TARGET, "Running self-test export");
            let _ = handlers.spawn(Arc::clone(shared).export(self_test_request()));
        }

        let reason = loop {
            tokio::select! {
                Some(event) = exports.recv() => {
                    let shared = Arc::clone(shared);
                    let _ = handlers.spawn(async move {
                        match event.decode::<ExportRequest>() {
                            Ok(request) => shared.export(request).await,
                            Err(e) => shared.reject_export(&event, &e).await,
                        }
                    });
                }
                Some(event) = mutations.recv() => {
                    let _ = handlers.spawn(Arc::clone(shared).mutate(event));
                }
                Some(event) = onboards.recv() => {
                    let _ = handlers.spawn(Arc::clone(shared).onboard(event));
                }
                Some(_) = uninstalls.recv() => break "uninstalled",
                Some(joined) = handlers.join_next() => {
                    if let Err(e) = joined {
                        log::error!(target: LOG_TARGET, "Request handler failed: {e}");
                    }
                }
                else => break "event stream closed",
            }
        };

        log::info!(target: LOG_TARGET, "Stopping: {reason}");
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                log::error!(target: LOG_TARGET, "Request handler failed: {e}");
            }
        }
        pinger.abort();

        let stop = Stop {
            reason: reason.to_string(),
            at: Utc::now(),
        };
        shared.publish(topic::STOP, &stop, None).await
    }
}

impl Shared {
    async fn publish(&self, topic: &str, payload: &impl Serialize, job_id: Option<&str>) -> Result<()> {
        let event = self.headers.apply(Event::new(topic, payload)?, job_id);
        self.bus.publish(event).await
    }

    /// Publish, logging instead of failing.
    async fn respond(&self, topic: &str, payload: &impl Serialize, job_id: &str) {
        if let Err(e) = self.publish(topic, payload, Some(job_id)).await {
            log::warn!(target: LOG_TARGET, "Could not send '{topic}' for '{job_id}': {e:#}");
        }
    }

    fn delegate(self: &Arc<Self>, integration: &str, job_id: &str) -> Arc<dyn AgentDelegate> {
        JobDelegate::new(integration, job_id, Arc::clone(&self.bus), self.headers.clone())
    }

    async fn ping(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            let _ = interval.tick().await;
            let state = if self.exporter.is_running() { AgentState::Exporting } else { AgentState::Idle };
            if let Err(e) = self.publish(topic::PING, &Ping { state, at: Utc::now() }, None).await {
                log::warn!(target: LOG_TARGET, "Could not send ping: {e:#}");
            }
        }
    }

    /// Send every crash report found on disk, removing each once sent.
    async fn send_crash_reports(&self) {
        let dir = self.integrations.locations().crashes_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Could not read crash reports in '{dir}': {e}");
                return;
            }
        };

        let mut paths: Vec<_> = entries.filter_map(|entry| entry.ok().map(|e| e.path())).filter(|p| p.is_file()).collect();
        paths.sort();

        for path in paths {
            let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "Could not read crash report '{}': {e}", path.display());
                    continue;
                }
            };

            log::info!(target: LOG_TARGET, "Sending crash report '{file_name}'");
            if let Err(e) = self.publish(topic::CRASH, &Crash { file_name, data }, None).await {
                log::warn!(target: LOG_TARGET, "Could not send crash report '{}': {e:#}", path.display());
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                log::warn!(target: LOG_TARGET, "Could not remove crash report '{}': {e}", path.display());
            }
        }
    }

    async fn export(self: Arc<Self>, request: ExportRequest) {
        let job_id = request.job_id.clone();
        let response = match self.exporter.export(request).await {
            Ok(integrations) => ExportResponse {
                job_id: job_id.clone(),
                success: true,
                error: None,
                integrations,
            },
            Err(e) => ExportResponse {
                job_id: job_id.clone(),
                success: false,
                error: Some(format!("{e:#}")),
                integrations: Vec::new(),
            },
        };
        self.respond(topic::EXPORT_RESPONSE, &response, &job_id).await;
    }

    async fn reject_export(&self, event: &Event, error: &ohno::AppError) {
        let job_id = event.payload.get("job_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let response = ExportResponse {
            job_id: job_id.clone(),
            success: false,
            error: Some(format!("{error:#}")),
            integrations: Vec::new(),
        };
        self.respond(topic::EXPORT_RESPONSE, &response, &job_id).await;
    }

    async fn mutate(self: Arc<Self>, event: Event) {
        let request_id = event.payload.get("request_id").and_then(Value::as_str).unwrap_or_default().to_string();

        let response = match self.run_mutation(&event).await {
            Ok(result) => MutationResponse {
                request_id: request_id.clone(),
                success: result.error.is_none(),
                mutated_objects: result.mutated_objects,
                error: result.error,
                error_code: result.error_code,
            },
            Err(e) => MutationResponse {
                request_id: request_id.clone(),
                success: false,
                error: Some(format!("{e:#}")),
                ..MutationResponse::default()
            },
        };
        self.respond(topic::MUTATION_RESPONSE, &response, &request_id).await;
    }

    async fn run_mutation(self: &Arc<Self>, event: &Event) -> Result<MutateResult> {
        let MutationRequest {
            request_id,
            integration,
            action,
            payload,
        } = event.decode()?;
        let _: Value = serde_json::from_str(&payload).into_app_err_with(|| format!("invalid payload for mutation '{action}'"))?;

        log::info!(target: LOG_TARGET, "Running mutation '{action}' on '{}'", integration.name);
        let config = self.integrations.export_config(&integration, false);
        let delegate = self.delegate(&integration.name, &request_id);

        self.integrations
            .run(&integration.name, delegate, move |i| i.mutate(action, payload, config))
            .await
    }

    async fn onboard(self: Arc<Self>, event: Event) {
        let request: OnboardRequest = match event.decode() {
            Ok(request) => request,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Dropping onboard request: {e:#}");
                return;
            }
        };

        let request_id = request.request_id.clone();
        let object_type = request.object_type;
        let response = match self.run_onboard(request).await {
            Ok(result) => OnboardResponse {
                request_id: request_id.clone(),
                object_type,
                success: result.error.is_none(),
                records: result.records,
                error: result.error,
            },
            Err(e) => OnboardResponse {
                request_id: request_id.clone(),
                object_type,
                success: false,
                records: Vec::new(),
                error: Some(format!("{e:#}")),
            },
        };
        self.respond(topic::ONBOARD_RESPONSE, &response, &request_id).await;
    }

    async fn run_onboard(self: &Arc<Self>, request: OnboardRequest) -> Result<OnboardExportResult> {
        log::info!(target: LOG_TARGET, "Onboarding {} from '{}'", request.object_type, request.integration.name);
        let config = self.integrations.export_config(&request.integration, false);
        let delegate = self.delegate(&request.integration.name, &request.request_id);
        let object_type = request.object_type;

        self.integrations
            .run(&request.integration.name, delegate, move |i| i.onboard_export(object_type, config))
            .await
    }
}

/// The export run by `service-run --self-test`.
#[must_use]
pub fn self_test_request() -> ExportRequest {
    ExportRequest {
        job_id: SELF_TEST_JOB_ID.to_string(),
        upload_url: None,
        reprocess_historical: false,
        integrations: vec![IntegrationRequest::new(MOCK_INTEGRATION)],
    }
}

/// Write a report of any panic in this process to `crashes_dir`, for the next start to send.
pub fn install_crash_reporter(crashes_dir: &Utf8Path) {
    let dir = crashes_dir.to_path_buf();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let path = dir.join(format!("crash-{}.txt", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let report = format!("{info}\n\n{}", std::backtrace::Backtrace::force_capture());
        let written = fs::create_dir_all(&dir).and_then(|()| fs::File::create(&path)?.write_all(report.as_bytes()));
        if let Err(e) = written {
            log::error!(target: LOG_TARGET, "Could not write crash report '{path}': {e}");
        }
        previous(info);
    }));
}
