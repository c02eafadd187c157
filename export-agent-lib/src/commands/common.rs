//! Options and setup shared by every command.

use crate::Result;
use crate::config::{AgentConfig, Locations};
use crate::service::{
    EventBus, EventHeaders, Exporter, HttpUploader, Integrations, InstanceLockGuard, ManifestRepoExporter, PluginExportPipeline,
    acquire_instance_lock,
};
use camino::Utf8PathBuf;
use clap::{Args, ValueEnum};
use core::time::Duration;
use std::sync::Arc;

/// How long to wait for another agent instance to let go of the data directory.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    None,

    /// Only error messages
    Error,

    /// Warning and error messages
    Warn,

    /// Info, warning, and error messages
    Info,

    /// Debug, info, warning, and error messages
    Debug,

    /// Trace, debug, info, warning, and error messages
    Trace,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the agent's state, logs and exports
    #[arg(long, value_name = "PATH", env = "EXPORT_AGENT_ROOT", global = true)]
    pub root: Option<Utf8PathBuf>,

    /// Path to configuration file (default is `agent.toml` in the agent root)
    #[arg(long, short = 'c', value_name = "PATH", global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Set the logging level for diagnostic output
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    pub log_level: LogLevel,
}

impl GlobalArgs {
    pub fn locations(&self) -> Result<Locations> {
        Locations::resolve(self.root.as_deref())
    }

    pub fn load_config(&self, locations: &Locations) -> Result<AgentConfig> {
        AgentConfig::load(locations, self.config.as_deref())
    }
}

/// Everything an exporting command needs, set up and locked.
#[derive(Debug)]
pub struct Agent {
    pub locations: Locations,
    pub integrations: Integrations,
    pub exporter: Exporter,
    _lock: InstanceLockGuard,
}

impl Agent {
    /// Load configuration, take the instance lock, and start the export queue.
    ///
    /// Pause and resume notices of integrations go to `bus`.
    pub async fn start(global: &GlobalArgs, bus: Arc<dyn EventBus>) -> Result<Self> {
        let locations = global.locations()?;
        let config = Arc::new(global.load_config(&locations)?);
        locations.create_dirs()?;
        let lock = acquire_instance_lock(&locations.lock_file(), LOCK_WAIT).await?;

        let headers = EventHeaders::new(&config.customer_id, &config.device_id);
        let integrations = Integrations::new(config, locations.clone());
        let pipeline = PluginExportPipeline::new(
            integrations.clone(),
            Arc::new(ManifestRepoExporter::new(locations.uploads_dir())),
            bus,
            headers,
        );
        let exporter = Exporter::start(Arc::new(pipeline), Arc::new(HttpUploader::default()), locations.uploads_dir());

        Ok(Self {
            locations,
            integrations,
            exporter,
            _lock: lock,
        })
    }
}

/// Initialize the logger for `log_level`, letting `RUST_LOG` override it
pub fn init_logging(log_level: LogLevel) {
    let level = match log_level {
        LogLevel::None => return,
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    // Logs go to stderr; stdout carries the event stream or the integration protocol.
    let _ = env_logger::Builder::from_env(env)
        .format_module_path(false)
        .format_target(matches!(log_level, LogLevel::Debug | LogLevel::Trace))
        .target(env_logger::Target::Stderr)
        .try_init();
}
