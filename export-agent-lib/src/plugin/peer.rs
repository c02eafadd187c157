//! Bidirectional JSON-lines RPC over a byte stream.
//!
//! Both ends of a connection are a [`Peer`]. Either side may call the other at any time;
//! calls and replies are multiplexed by request id. Each frame is one JSON object on its
//! own line.

use crate::Result;
use core::sync::atomic::{AtomicU64, Ordering};
use futures::future::BoxFuture;
use ohno::{IntoAppError, app_err, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};

const LOG_TARGET: &str = "      peer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Reply {
        id: u64,
        #[serde(default)]
        ok: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
}

/// Serves calls made by the remote side.
pub trait Handler: Send + Sync {
    fn handle(&self, method: String, params: Value) -> BoxFuture<'static, Result<Value>>;
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value, String>>>;

#[derive(Debug)]
struct Inner {
    outgoing: mpsc::UnboundedSender<Frame>,

    /// `None` once the connection is closed.
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

/// One end of an RPC connection.
#[derive(Debug, Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// Start serving the connection on background tasks.
    pub fn start<R, W>(reader: R, writer: W, handler: Arc<dyn Handler>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start_with(reader, writer, |_| handler)
    }

    /// Like [`Peer::start`], for handlers that call back over the same connection.
    ///
    /// The handler is built before the first frame is read.
    pub fn start_with<R, W, F>(reader: R, writer: W, make_handler: F) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Self) -> Arc<dyn Handler>,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            outgoing,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed,
        });

        let peer = Self { inner };
        let handler = make_handler(peer.clone());

        let _ = tokio::spawn(write_frames(writer, rx));
        let _ = tokio::spawn(read_frames(reader, Arc::clone(&peer.inner), handler));

        peer
    }

    /// Call `method` on the remote side and decode its reply.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: impl Serialize) -> Result<T> {
        let params = serde_json::to_value(params).into_app_err_with(|| format!("encoding parameters of '{method}'"))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().expect("lock not poisoned");
            let Some(pending) = pending.as_mut() else {
                bail!("cannot call '{method}': connection closed");
            };
            let _ = pending.insert(id, tx);
        }

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            params,
        };
        if self.inner.outgoing.send(frame).is_err() {
            self.forget(id);
            bail!("cannot call '{method}': connection closed");
        }

        let reply = match rx.await {
            Ok(Ok(value)) => value,
            Ok(Err(message)) => return Err(app_err!("{message}")),
            Err(_) => bail!("connection closed before '{method}' returned"),
        };

        serde_json::from_value(reply).into_app_err_with(|| format!("decoding result of '{method}'"))
    }

    /// Whether the remote side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the remote side has gone away.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn forget(&self, id: u64) {
        if let Some(pending) = self.inner.pending.lock().expect("lock not poisoned").as_mut() {
            let _ = pending.remove(&id);
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                log::error!(target: LOG_TARGET, "Could not encode frame: {e}");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await
        {
            log::debug!(target: LOG_TARGET, "Connection write failed: {e}");
            return;
        }
    }
}

async fn read_frames<R: AsyncRead + Unpin>(reader: R, inner: Arc<Inner>, handler: Arc<dyn Handler>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::debug!(target: LOG_TARGET, "Connection read failed: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Call { id, method, params }) => {
                let handler = Arc::clone(&handler);
                let outgoing = inner.outgoing.clone();
                let _ = tokio::spawn(async move {
                    let reply = match handler.handle(method, params).await {
                        Ok(ok) => Frame::Reply { id, ok, err: None },
                        Err(e) => Frame::Reply {
                            id,
                            ok: Value::Null,
                            err: Some(format!("{e:#}")),
                        },
                    };
                    let _ = outgoing.send(reply);
                });
            }
            Ok(Frame::Reply { id, ok, err }) => {
                let waiter = inner
                    .pending
                    .lock()
                    .expect("lock not poisoned")
                    .as_mut()
                    .and_then(|p| p.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(err.map_or(Ok(ok), Err));
                    }
                    None => log::warn!(target: LOG_TARGET, "Received reply for unknown call {id}"),
                }
            }
            Err(e) => log::warn!(target: LOG_TARGET, "Ignoring malformed frame: {e}"),
        }
    }

    // Dropping the waiters fails every call still in flight.
    drop(inner.pending.lock().expect("lock not poisoned").take());
    let _ = inner.closed.send_replace(true);
}

/// Decode call parameters of `method`.
pub fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).into_app_err_with(|| format!("decoding parameters of '{method}'"))
}

/// Encode a call result.
pub fn encode_result<T: Serialize>(method: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).into_app_err_with(|| format!("encoding result of '{method}'"))
}
