use crate::Result;
use camino::Utf8Path;
use core::time::Duration;
use fs4::fs_std::FileExt;
use ohno::{IntoAppError, app_err};
use std::fs::{self, File, OpenOptions};

const LOG_TARGET: &str = "   service";

/// Holds the agent's single-instance lock until dropped.
#[derive(Debug)]
pub struct InstanceLockGuard(File);

impl Drop for InstanceLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.unlock() {
            log::warn!(target: LOG_TARGET, "Could not release instance lock: {e:#}");
        }
    }
}

/// Take the exclusive advisory lock on `lock_path`, waiting at most `wait`.
///
/// Fails if another agent holds the lock for longer.
pub async fn acquire_instance_lock(lock_path: &Utf8Path, wait: Duration) -> Result<InstanceLockGuard> {
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir).into_app_err_with(|| format!("creating directory '{dir}'"))?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .into_app_err_with(|| format!("opening instance lock file '{lock_path}'"))?;

    // A plain thread rather than a blocking task: a lock wait that times out must not keep
    // the runtime from shutting down.
    let path = lock_path.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _ = std::thread::spawn(move || {
        let locked = file
            .lock_exclusive()
            .into_app_err_with(|| format!("acquiring exclusive lock on '{path}'"))
            .map(|()| file);
        if locked.is_ok() {
            log::debug!(target: LOG_TARGET, "Acquired instance lock '{path}'");
        }
        let _ = tx.send(locked);
    });

    match tokio::time::timeout(wait, rx).await {
        Ok(received) => Ok(InstanceLockGuard(received.into_app_err("lock thread exited")??)),
        Err(_) => Err(app_err!("another export agent is already running (lock '{lock_path}' is held)")),
    }
}
