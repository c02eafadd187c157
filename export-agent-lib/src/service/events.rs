//! Publish/subscribe channel to the backend.
//!
//! The service consumes requests and emits responses and notifications as [`Event`]s
//! through an [`EventBus`]. [`StdioBus`] carries them as JSON lines over a byte stream;
//! [`InMemoryBus`] keeps them in process.

use crate::Result;
use futures::future::BoxFuture;
use ohno::{IntoAppError, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const LOG_TARGET: &str = "    events";

pub const HEADER_CUSTOMER_ID: &str = "customer_id";
pub const HEADER_UUID: &str = "uuid";
pub const HEADER_JOB_ID: &str = "job_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(topic: &str, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            topic: topic.to_string(),
            headers: BTreeMap::new(),
            payload: serde_json::to_value(payload).into_app_err_with(|| format!("encoding '{topic}' event"))?,
        })
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Decode the payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).into_app_err_with(|| format!("decoding '{}' event", self.topic))
    }
}

/// Identifies this agent on every outgoing event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHeaders {
    pub customer_id: String,
    pub uuid: String,
}

impl EventHeaders {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            uuid: uuid.into(),
        }
    }

    /// Stamp `event` with the agent headers and an optional job id.
    #[must_use]
    pub fn apply(&self, mut event: Event, job_id: Option<&str>) -> Event {
        let _ = event.headers.insert(HEADER_CUSTOMER_ID.to_string(), self.customer_id.clone());
        let _ = event.headers.insert(HEADER_UUID.to_string(), self.uuid.clone());
        if let Some(job_id) = job_id {
            let _ = event.headers.insert(HEADER_JOB_ID.to_string(), job_id.to_string());
        }
        event
    }
}

/// Events of one topic, in arrival order. Ends once the bus stops delivering.
pub type Subscription = mpsc::UnboundedReceiver<Event>;

pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription;

    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>>;
}

/// Subscribers by topic. `None` once the bus stopped delivering.
#[derive(Debug)]
struct Topics(Mutex<Option<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>>);

impl Default for Topics {
    fn default() -> Self {
        Self(Mutex::new(Some(HashMap::new())))
    }
}

impl Topics {
    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(topics) = self.0.lock().expect("lock not poisoned").as_mut() {
            topics.entry(topic.to_string()).or_default().push(tx);
        }
        rx
    }

    fn deliver(&self, event: &Event) {
        if let Some(topics) = self.0.lock().expect("lock not poisoned").as_mut()
            && let Some(subscribers) = topics.get_mut(&event.topic)
        {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn close(&self) {
        drop(self.0.lock().expect("lock not poisoned").take());
    }
}

/// Bus delivering every published event to local subscribers and keeping a copy.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    topics: Topics,
    published: Mutex<Vec<Event>>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().expect("lock not poisoned").clone()
    }

    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<Event> {
        self.published().into_iter().filter(|e| e.topic == topic).collect()
    }

    /// End every subscription.
    pub fn close(&self) {
        self.topics.close();
    }
}

impl EventBus for InMemoryBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.topics.subscribe(topic)
    }

    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.topics.deliver(&event);
            self.published.lock().expect("lock not poisoned").push(event);
            Ok(())
        })
    }
}

/// Bus reading inbound events from one stream and writing outbound events to another.
///
/// Subscriptions end when the inbound stream does.
#[derive(Debug)]
pub struct StdioBus {
    topics: Arc<Topics>,
    outgoing: mpsc::UnboundedSender<Event>,
}

impl StdioBus {
    /// Start reading and writing on background tasks.
    pub fn start<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let topics = Arc::new(Topics::default());
        let (outgoing, rx) = mpsc::unbounded_channel();

        let _ = tokio::spawn(write_events(writer, rx));
        let _ = tokio::spawn(read_events(reader, Arc::clone(&topics)));

        Arc::new(Self { topics, outgoing })
    }

    /// Serve the bus on the process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Arc<Self> {
        Self::start(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl EventBus for StdioBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.topics.subscribe(topic)
    }

    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let topic = event.topic.clone();
            if self.outgoing.send(event).is_err() {
                bail!("cannot publish '{topic}': event stream closed");
            }
            Ok(())
        })
    }
}

async fn write_events<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!(target: LOG_TARGET, "Could not encode '{}' event: {e}", event.topic);
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
            log::warn!(target: LOG_TARGET, "Event stream write failed: {e}");
            return;
        }
    }
}

async fn read_events<R: AsyncRead + Unpin>(reader: R, topics: Arc<Topics>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Event>(&line) {
                Ok(event) => {
                    log::debug!(target: LOG_TARGET, "Received '{}' event", event.topic);
                    topics.deliver(&event);
                }
                Err(e) => log::warn!(target: LOG_TARGET, "Ignoring malformed event: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Event stream read failed: {e}");
                break;
            }
        }
    }

    log::debug!(target: LOG_TARGET, "Event stream closed");
    topics.close();
}
