//! Command-line interface for export-agent
//!
//! # Commands
//!
//! - **service-run**: Run the agent service. Requests arrive as JSON-lines events on
//!   stdin; responses, pings and lifecycle events leave on stdout. `--self-test` runs one
//!   export with the built-in mock integration at startup.
//! - **export**: Run one export job in the foreground from an integrations file
//! - **integration**: Serve a built-in integration as a worker process. The agent starts
//!   itself this way for every integration it runs.
//! - **validate-config**: Check the agent configuration
//!
//! Every command shares `--root` (the agent's data directory), `--config` and
//! `--log-level`. Logs always go to stderr, since stdout carries the event stream or the
//! worker protocol.

mod common;
mod export;
mod host;
mod integration;
mod run;
mod service_run;
mod validate;

pub use common::{GlobalArgs, LogLevel};
pub use export::{ExportArgs, export, read_integrations_file};
pub use host::Host;
pub use integration::{IntegrationArgs, serve_integration};
pub use run::run;
pub use service_run::{ServiceRunArgs, service_run};
pub use validate::validate_config;
