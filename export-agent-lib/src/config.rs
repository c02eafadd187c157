//! Agent configuration and on-disk locations.

use crate::Result;
use crate::plugin::DEFAULT_FANOUT_BUFFER;
use crate::request::RetryPolicy;
use camino::{Utf8Path, Utf8PathBuf};
use core::time::Duration;
use directories::BaseDirs;
use ohno::{IntoAppError, app_err};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;

/// Name of the configuration file looked up under the agent root.
pub const CONFIG_FILE_NAME: &str = "agent.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Customer the agent exports for, sent with every event
    pub customer_id: String,

    /// Identifies this agent installation, sent with every event
    pub device_id: String,

    /// Maximum simultaneous outbound calls per integration
    pub request_concurrency: usize,

    /// Probe the provider's quota every this many calls (0 disables probing)
    pub check_rate_limit_every: u64,

    /// Fraction of the quota left untouched before pausing (0..1)
    pub request_buffer: f64,

    /// Shortest pause when throttled
    #[serde(with = "humantime_serde")]
    pub min_pause: Duration,

    /// Longest pause when throttled
    #[serde(with = "humantime_serde")]
    pub max_pause: Duration,

    /// Pause used when a throttling response carries no reset time
    #[serde(with = "humantime_serde")]
    pub throttle_fallback_wait: Duration,

    /// Pause used when the provider's abuse detection triggers
    #[serde(with = "humantime_serde")]
    pub abuse_wait: Duration,

    /// Retries of transient failures
    pub max_general_retries: u32,

    /// Retries of throttled calls
    pub max_throttled_retries: u32,

    /// Base delay between retries of transient failures
    #[serde(with = "humantime_serde")]
    pub general_retry_base_delay: Duration,

    /// Time between liveness pings
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Pages each fan-out stage may have queued
    pub fanout_buffer: usize,

    /// Executable serving integrations, instead of the running agent
    pub integration_command: Option<Utf8PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            customer_id: String::new(),
            device_id: String::new(),
            request_concurrency: retry.request_concurrency,
            check_rate_limit_every: retry.check_rate_limit_every,
            request_buffer: retry.request_buffer,
            min_pause: retry.min_pause,
            max_pause: retry.max_pause,
            throttle_fallback_wait: retry.throttle_fallback_wait,
            abuse_wait: retry.abuse_wait,
            max_general_retries: retry.max_general_retries,
            max_throttled_retries: retry.max_throttled_retries,
            general_retry_base_delay: retry.general_retry_base_delay,
            ping_interval: Duration::from_secs(30),
            fanout_buffer: DEFAULT_FANOUT_BUFFER,
            integration_command: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `config_path`, or from `agent.toml` under the agent root.
    ///
    /// An explicit path must exist. Without one, a missing file means defaults.
    pub fn load(locations: &Locations, config_path: Option<&Utf8Path>) -> Result<Self> {
        let (path, text) = if let Some(path) = config_path {
            let text = fs::read_to_string(path).into_app_err_with(|| format!("reading agent configuration file '{path}'"))?;
            (path.to_path_buf(), text)
        } else {
            let path = locations.config_file();
            match fs::read_to_string(&path) {
                Ok(text) => (path, text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
                Err(e) => return Err(e).into_app_err_with(|| format!("reading agent configuration file '{path}'")),
            }
        };

        Self::parse(&text).into_app_err_with(|| format!("loading configuration file '{path}'"))
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).into_app_err("parsing agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_concurrency == 0 {
            return Err(app_err!("request_concurrency must be at least 1"));
        }

        if !(0.0..1.0).contains(&self.request_buffer) {
            return Err(app_err!("request_buffer must be in [0, 1), got {}", self.request_buffer));
        }

        if self.min_pause > self.max_pause {
            return Err(app_err!(
                "min_pause ({:?}) must not exceed max_pause ({:?})",
                self.min_pause,
                self.max_pause
            ));
        }

        if self.ping_interval.is_zero() {
            return Err(app_err!("ping_interval must be greater than zero"));
        }

        if self.fanout_buffer == 0 {
            return Err(app_err!("fanout_buffer must be at least 1"));
        }

        Ok(())
    }

    /// Retry and pacing settings handed to every integration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            request_concurrency: self.request_concurrency,
            check_rate_limit_every: self.check_rate_limit_every,
            request_buffer: self.request_buffer,
            min_pause: self.min_pause,
            max_pause: self.max_pause,
            throttle_fallback_wait: self.throttle_fallback_wait,
            abuse_wait: self.abuse_wait,
            max_general_retries: self.max_general_retries,
            max_throttled_retries: self.max_throttled_retries,
            general_retry_base_delay: self.general_retry_base_delay,
        }
    }
}

/// Paths of everything the agent keeps on disk, relative to one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    root: Utf8PathBuf,
}

impl Locations {
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data dir>/export-agent`, or the given root.
    pub fn resolve(root: Option<&Utf8Path>) -> Result<Self> {
        if let Some(root) = root {
            return Ok(Self::new(root));
        }

        let data_dir = BaseDirs::new().into_app_err("could not determine data directory")?.data_dir().join("export-agent");
        let root = Utf8PathBuf::from_path_buf(data_dir).map_err(|p| app_err!("data directory '{}' is not valid UTF-8", p.display()))?;
        Ok(Self::new(root))
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[must_use]
    pub fn config_file(&self) -> Utf8PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Integration worker logs.
    #[must_use]
    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root.join("logs")
    }

    /// Session output of the current job, uploaded when it finishes.
    #[must_use]
    pub fn uploads_dir(&self) -> Utf8PathBuf {
        self.root.join("uploads")
    }

    #[must_use]
    pub fn temp_dir(&self) -> Utf8PathBuf {
        self.root.join("temp")
    }

    /// Incremental cursors.
    #[must_use]
    pub fn state_file(&self) -> Utf8PathBuf {
        self.root.join("last_processed.json")
    }

    /// Crash reports left by earlier runs, sent when the service starts.
    #[must_use]
    pub fn crashes_dir(&self) -> Utf8PathBuf {
        self.root.join("crashes")
    }

    #[must_use]
    pub fn lock_file(&self) -> Utf8PathBuf {
        self.root.join("agent.lock")
    }

    /// Create every directory the agent writes into.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.logs_dir(), self.uploads_dir(), self.temp_dir(), self.crashes_dir()] {
            fs::create_dir_all(&dir).into_app_err_with(|| format!("creating directory '{dir}'"))?;
        }
        Ok(())
    }
}
