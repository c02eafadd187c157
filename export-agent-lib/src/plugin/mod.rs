//! Integration worker processes
//!
//! Each integration runs in its own process and is reached through the [`Integration`]
//! contract; the worker calls back into the agent through [`AgentDelegate`]. The agent
//! side is an [`IntegrationProcess`]; the worker side is [`serve_stdio`].

mod contract;
mod handshake;
mod host;
mod mock;
mod peer;
mod rpc;
mod serve;

pub use contract::{
    AgentDelegate, DEFAULT_FANOUT_BUFFER, ExportConfig, ExportProject, ExportResult, GitRepoFetch, GitRepoFetchPr, Integration,
    MUTATE_ERROR_NOT_FOUND, MutateResult, NoopDelegate, OnboardExportResult, OnboardObjectType,
};
pub use handshake::{SetupError, handshake_line};
pub use host::{IntegrationProcess, PANIC_MARKER, WorkerCommand, detect_panic};
pub use mock::{MOCK_INTEGRATION, MockIntegration};
pub use peer::{Handler, Peer};
pub use rpc::{DelegateClient, DelegateServer, IntegrationClient, IntegrationServer};
pub use serve::{serve, serve_stdio};

use std::sync::Arc;

/// Integrations compiled into the agent, by name.
#[must_use]
pub fn builtin(name: &str) -> Option<Arc<dyn Integration>> {
    match name {
        MOCK_INTEGRATION => Some(Arc::new(MockIntegration::default())),
        _ => None,
    }
}
