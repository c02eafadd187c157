use super::common::{Agent, GlobalArgs};
use crate::Result;
use crate::service::{EventBus, ServiceRunner, StdioBus, install_crash_reporter};
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
pub struct ServiceRunArgs {
    /// Run one export with the built-in mock integration at startup
    #[arg(long)]
    pub self_test: bool,
}

/// Serve requests from stdin and send events to stdout until uninstalled or stdin closes
pub async fn service_run(global: &GlobalArgs, args: &ServiceRunArgs) -> Result<()> {
    let bus = StdioBus::stdio();
    let agent = Agent::start(global, Arc::clone(&bus) as Arc<dyn EventBus>).await?;
    install_crash_reporter(&agent.locations.crashes_dir());

    let Agent {
        integrations, exporter, ..
    } = &agent;
    ServiceRunner::new(integrations.clone(), exporter.clone(), bus)
        .with_self_test(args.self_test)
        .run()
        .await
}
