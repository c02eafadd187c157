//! Command dispatch logic for export-agent

use super::common::{GlobalArgs, init_logging};
use super::{ExportArgs, IntegrationArgs, ServiceRunArgs, export, serve_integration, service_run, validate_config};
use crate::{Host, Result};
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand};

const CLAP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "export-agent", version, long_about = None)]
#[command(about = "Incrementally export developer-tool data through isolated integration workers")]
#[command(styles = CLAP_STYLES)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: AgentSubcommand,
}

#[derive(Subcommand, Debug)]
enum AgentSubcommand {
    /// Run the agent service, exchanging events over stdin and stdout
    ServiceRun(ServiceRunArgs),
    /// Run one export in the foreground
    Export(ExportArgs),
    /// Serve a built-in integration as a worker process (used by the agent itself)
    Integration(IntegrationArgs),
    /// Validate the agent configuration
    ValidateConfig,
}

/// Parse command-line arguments and run the selected command
///
/// # Errors
///
/// Returns an error if the executed command fails
pub async fn run<I, T, H>(host: &mut H, args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
    H: Host,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.global.log_level);

    match &cli.command {
        AgentSubcommand::ServiceRun(args) => service_run(&cli.global, args).await,
        AgentSubcommand::Export(args) => export(host, &cli.global, args).await,
        AgentSubcommand::Integration(args) => serve_integration(args).await,
        AgentSubcommand::ValidateConfig => validate_config(host, &cli.global),
    }
}
