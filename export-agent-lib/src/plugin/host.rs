//! Supervision of one integration worker process.

use super::contract::{AgentDelegate, Integration};
use super::handshake::{self, COOKIE_KEY, COOKIE_VALUE, SetupError};
use super::peer::{Handler, Peer};
use super::rpc::{DelegateServer, IntegrationClient};
use crate::Result;
use camino::{Utf8Path, Utf8PathBuf};
use core::time::Duration;
use ohno::IntoAppError;
use core::sync::atomic::{AtomicU64, Ordering};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const LOG_TARGET: &str = "      host";

/// Prefix of the first line a crashing worker writes to stderr.
pub const PANIC_MARKER: &str = "panic:";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Numbers the log files of workers started by this agent.
static NEXT_LOG_SEQ: AtomicU64 = AtomicU64::new(1);

/// How to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    #[must_use]
    pub const fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Serve the built-in integration `name` from `agent_exe`, or from the running
    /// executable when no override is given.
    pub fn builtin(agent_exe: Option<&Utf8Path>, name: &str) -> Result<Self> {
        let program = match agent_exe {
            Some(exe) => exe.as_std_path().to_path_buf(),
            None => std::env::current_exe().into_app_err("locating the agent executable")?,
        };
        Ok(Self::new(program, vec!["integration".to_string(), name.to_string()]))
    }
}

/// A running integration worker and its RPC client.
#[derive(Debug)]
pub struct IntegrationProcess {
    name: String,
    log_path: Utf8PathBuf,
    log: Option<File>,
    child: Child,
    client: IntegrationClient,
    closed: bool,
}

impl IntegrationProcess {
    /// Launch the worker, complete the handshake, and initialize it with `delegate`.
    ///
    /// The worker's stderr goes to a fresh `<logs_dir>/<name>-<n>.log` owned by this
    /// process alone. Other workers of the same integration, live or not, keep their logs.
    pub async fn start(
        name: &str,
        command: &WorkerCommand,
        logs_dir: &Utf8Path,
        delegate: Arc<dyn AgentDelegate>,
    ) -> Result<Self, SetupError> {
        let (log_path, log) = create_log(logs_dir, name).map_err(|e| SetupError::Log(format!("'{logs_dir}': {e}")))?;
        let stderr = log.try_clone().map_err(|e| SetupError::Log(format!("'{log_path}': {e}")))?;

        log::debug!(target: LOG_TARGET, "Starting integration '{name}': {} {:?}", command.program.display(), command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env(COOKIE_KEY, COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SetupError::Spawn(format!("{}: {e}", command.program.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SetupError::Spawn("worker pipes are unavailable".into()));
        };

        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, stdout.read_line(&mut line)).await {
            Ok(Ok(0)) => return Err(SetupError::Handshake("worker exited before the handshake".into())),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SetupError::Handshake(e.to_string())),
            Err(_) => return Err(SetupError::Handshake(format!("no handshake within {HANDSHAKE_TIMEOUT:?}"))),
        }
        handshake::verify(&line)?;

        let delegate_server = Arc::new(DelegateServer::default());
        let peer = Peer::start(stdout, stdin, Arc::clone(&delegate_server) as Arc<dyn Handler>);
        let client = IntegrationClient::new(peer, delegate_server);

        let mut process = Self {
            name: name.to_string(),
            log_path,
            log: Some(log),
            child,
            client,
            closed: false,
        };

        if let Err(e) = process.client.init(delegate).await {
            let (panic, _) = process.close_and_detect_panic().await;
            let mut msg = format!("{e:#}");
            if let Some(panic) = panic {
                msg = format!("{msg}\n{panic}");
            }
            return Err(SetupError::Init(msg));
        }

        log::info!(target: LOG_TARGET, "Started integration '{name}'");
        Ok(process)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn log_path(&self) -> &Utf8Path {
        &self.log_path
    }

    /// The worker's [`Integration`] contract.
    #[must_use]
    pub fn integration(&self) -> &dyn Integration {
        &self.client
    }

    /// Kill the worker and close its log. Later calls do nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.child.start_kill() {
            log::debug!(target: LOG_TARGET, "Integration '{}' already exited: {e}", self.name);
        }
        let status = self.child.wait().await;
        log::debug!(target: LOG_TARGET, "Integration '{}' stopped: {status:?}", self.name);

        if let Some(log) = self.log.take() {
            log.sync_all().into_app_err_with(|| format!("closing integration log '{}'", self.log_path))?;
        }
        Ok(())
    }

    /// Close the worker, then look for a crash report in its log.
    ///
    /// Returns the crash report, if any, together with the outcome of closing.
    pub async fn close_and_detect_panic(&mut self) -> (Option<String>, Result<()>) {
        let closed = self.close().await;
        crash_report(&self.log_path, fs::read_to_string(&self.log_path), closed)
    }
}

/// The crash report is returned whatever the outcome of closing; a close error wins
/// over a read error.
fn crash_report(log_path: &Utf8Path, log: io::Result<String>, closed: Result<()>) -> (Option<String>, Result<()>) {
    match log {
        Ok(text) => (detect_panic(&text), closed),
        Err(e) => {
            let read_err = Err(e).into_app_err_with(|| format!("reading integration log '{log_path}'"));
            (None, if closed.is_err() { closed } else { read_err })
        }
    }
}

/// Create a log file for a new worker of `name` without touching any existing file.
fn create_log(dir: &Utf8Path, name: &str) -> io::Result<(Utf8PathBuf, File)> {
    fs::create_dir_all(dir)?;
    loop {
        let seq = NEXT_LOG_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{name}-{seq}.log"));
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            // left behind by an earlier agent run
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
}

/// The first line starting with the panic marker and everything after it.
#[must_use]
pub fn detect_panic(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.split('\n').collect();
    let start = lines.iter().position(|line| line.starts_with(PANIC_MARKER))?;
    Some(lines[start..].join("\n"))
}
