//! The agent service: export queue, uploads, and request handling
//!
//! Requests arrive as events on an [`EventBus`]. Exports are serialized through the
//! [`Exporter`], which purges the uploads directory, runs the [`ExportPipeline`] and
//! uploads the result. The [`PluginExportPipeline`] runs each integration of a job in its
//! own worker process, one at a time, and hands the repositories they ask for to a
//! [`RepoExporter`]. The [`ServiceRunner`] ties it together for `service-run`.

mod events;
mod exporter;
mod instance_lock;
mod job;
mod messages;
mod runner;
mod uploader;

pub use events::{Event, EventBus, EventHeaders, HEADER_CUSTOMER_ID, HEADER_JOB_ID, HEADER_UUID, InMemoryBus, StdioBus, Subscription};
pub use exporter::{ExportPipeline, Exporter};
pub use instance_lock::{InstanceLockGuard, acquire_instance_lock};
pub use job::{CommandFactory, Integrations, JobDelegate, ManifestRepoExporter, PluginExportPipeline, RepoExporter};
pub use messages::{
    AgentState, Crash, ExportRequest, ExportResponse, IntegrationOutcome, IntegrationRequest, MutationRequest, MutationResponse,
    OnboardRequest, OnboardResponse, Pause, Ping, Resume, Start, Stop, topic,
};
pub use runner::{SELF_TEST_JOB_ID, ServiceRunner, install_crash_reporter, self_test_request};
pub use uploader::{HttpUploader, Uploader, archive_dir};
