//! Worker side of an integration process.

use super::contract::Integration;
use super::handshake::{COOKIE_KEY, COOKIE_VALUE, handshake_line};
use super::host::PANIC_MARKER;
use super::peer::{Handler, Peer};
use super::rpc::IntegrationServer;
use crate::Result;
use ohno::{IntoAppError, bail};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Exit code of a worker that panicked.
const PANIC_EXIT_CODE: i32 = 2;

/// Serve `integration` over stdin/stdout until the agent disconnects.
///
/// Refuses to run unless started by the agent.
pub async fn serve_stdio(integration: Arc<dyn Integration>) -> Result<()> {
    if std::env::var(COOKIE_KEY).ok().as_deref() != Some(COOKIE_VALUE) {
        bail!("this command serves an integration to the export agent and is not meant to be run directly");
    }

    install_panic_hook();

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", handshake_line()).as_bytes())
        .await
        .into_app_err("writing handshake")?;
    stdout.flush().await.into_app_err("writing handshake")?;

    serve(tokio::io::stdin(), stdout, integration).await;
    Ok(())
}

/// Serve `integration` on an established connection until it closes.
pub async fn serve<R, W>(reader: R, writer: W, integration: Arc<dyn Integration>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let peer = Peer::start_with(reader, writer, |peer| {
        Arc::new(IntegrationServer::new(integration, peer)) as Arc<dyn Handler>
    });
    peer.closed().await;
}

/// Report panics on stderr in the form the agent scans for, then exit.
///
/// A panic on any task takes the worker down, so the agent sees the connection close
/// instead of waiting on a reply that will never come.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info.location().map(ToString::to_string).unwrap_or_default();
        let backtrace = std::backtrace::Backtrace::force_capture();

        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{PANIC_MARKER} {message}\n\nat {location}\n{backtrace}");
        let _ = stderr.flush();

        std::process::exit(PANIC_EXIT_CODE);
    }));
}
