//! Message broker: publish/subscribe, pattern subscriptions and a keyed TTL
//! store on top of a pluggable [`Transport`].
//!
//! Every subscription owns one transport session and one listener task. The
//! listener decodes frames into envelopes and feeds an unbounded channel, so a
//! slow consumer never holds up publishers or other subscribers. Malformed
//! frames are logged and skipped; a lost session ends the stream with a single
//! [`Error::Connection`].

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod transport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Backend, BrokerSettings};
use crate::error::{Error, Result};
use crate::protocol::MessageEnvelope;

pub use memory::MemoryTransport;
pub use transport::{Connection, RawMessage, Session, SubscriptionTarget, Transport};

/// Default lifetime of stored values, in seconds.
pub const DEFAULT_TTL_SECONDS: u64 = 3600;

const ENVELOPE_KEY_PREFIX: &str = "envelope:";

/// Build a broker for the configured backend. The broker starts disconnected.
pub fn open(settings: &BrokerSettings) -> Result<Broker> {
    let transport: Arc<dyn Transport> = match settings.backend {
        Backend::Memory => Arc::new(MemoryTransport::new()),
        #[cfg(feature = "redis")]
        Backend::Redis => Arc::new(self::redis::RedisTransport::new(&settings.redis_url)?),
        #[cfg(not(feature = "redis"))]
        Backend::Redis => {
            return Err(Error::Config(
                "redis backend requested but agentbus was built without the `redis` feature"
                    .to_string(),
            ))
        }
    };
    Ok(Broker::new(transport).with_default_ttl(settings.default_ttl_seconds))
}

struct Active {
    conn: Arc<dyn Connection>,
    shutdown: watch::Sender<bool>,
    // Every listener holds a clone; recv() yields None once all have exited.
    alive_tx: mpsc::Sender<()>,
    alive_rx: mpsc::Receiver<()>,
}

struct ListenerHandles {
    conn: Arc<dyn Connection>,
    shutdown: watch::Receiver<bool>,
    alive: mpsc::Sender<()>,
}

pub struct Broker {
    transport: Arc<dyn Transport>,
    default_ttl_seconds: u64,
    state: RwLock<Option<Active>>,
}

impl Broker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            state: RwLock::new(None),
        }
    }

    /// Override the TTL used by [`Broker::set_with_default_expiry`].
    pub fn with_default_ttl(mut self, ttl_seconds: u64) -> Self {
        self.default_ttl_seconds = ttl_seconds;
        self
    }

    pub fn default_ttl_seconds(&self) -> u64 {
        self.default_ttl_seconds
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_some()
    }

    /// Open and verify the transport connection. No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let conn = self
            .transport
            .connect()
            .await
            .map_err(into_connection_error)?;
        if let Err(e) = conn.ping().await {
            error!(transport = self.transport.name(), error = %e, "Broker ping failed");
            let _ = conn.close().await;
            return Err(into_connection_error(e));
        }

        let (shutdown, _) = watch::channel(false);
        let (alive_tx, alive_rx) = mpsc::channel(1);
        let installed = {
            let mut state = self.state.write();
            if state.is_none() {
                *state = Some(Active {
                    conn: Arc::clone(&conn),
                    shutdown,
                    alive_tx,
                    alive_rx,
                });
                true
            } else {
                false
            }
        };

        if installed {
            info!(transport = self.transport.name(), "Connected to message broker");
        } else {
            // Lost a race with a concurrent connect(); keep the existing one.
            let _ = conn.close().await;
        }
        Ok(())
    }

    /// Connect, run `work`, then disconnect whether or not `work` succeeded.
    pub async fn scoped<T, E, F, Fut>(self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<Broker>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let broker = Arc::new(self);
        broker.connect().await?;

        let outcome = work(Arc::clone(&broker)).await;
        if let Err(e) = broker.disconnect().await {
            warn!(error = %e, "Error disconnecting scoped broker");
        }
        outcome
    }

    /// Stop every open subscription, then close the connection. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let active = self.state.write().take();
        let Some(Active {
            conn,
            shutdown,
            alive_tx,
            mut alive_rx,
        }) = active
        else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        drop(shutdown);
        drop(alive_tx);
        // Waits until every listener has unsubscribed and closed its session
        let _ = alive_rx.recv().await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Error closing broker connection");
        }
        info!(transport = self.transport.name(), "Disconnected from message broker");
        Ok(())
    }

    fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.state
            .read()
            .as_ref()
            .map(|active| Arc::clone(&active.conn))
            .ok_or(Error::NotConnected)
    }

    fn listener_handles(&self) -> Result<ListenerHandles> {
        let state = self.state.read();
        let active = state.as_ref().ok_or(Error::NotConnected)?;
        Ok(ListenerHandles {
            conn: Arc::clone(&active.conn),
            shutdown: active.shutdown.subscribe(),
            alive: active.alive_tx.clone(),
        })
    }

    /// Publish an envelope to a topic.
    ///
    /// Returns how many subscribers the transport handed it to. Zero means
    /// nobody was listening and the message is gone.
    pub async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<usize> {
        let conn = self.connection()?;
        if topic.trim().is_empty() {
            return Err(Error::Validation("topic must not be empty".to_string()));
        }

        let payload = envelope.to_json()?;
        match conn.publish(topic, &payload).await {
            Ok(receivers) => {
                debug!(
                    topic,
                    message_id = %envelope.id,
                    message_type = %envelope.message_type(),
                    receivers,
                    "Published message"
                );
                Ok(receivers)
            }
            Err(e) => {
                error!(topic, message_id = %envelope.id, error = %e, "Failed to publish message");
                Err(Error::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Subscribe to one topic.
    pub async fn subscribe(&self, topic: &str) -> Result<TopicSubscription> {
        if topic.trim().is_empty() {
            return Err(Error::Validation("topic must not be empty".to_string()));
        }
        self.open_subscription(SubscriptionTarget::Topic(topic.to_string()), decode_envelope)
            .await
    }

    /// Subscribe to every topic matching a glob pattern such as `agent:A:*`.
    ///
    /// Patterns use Redis glob syntax on every backend: `*`, `?`, `[abc]`,
    /// `[^abc]` and `\` escapes. Items carry the concrete topic each envelope
    /// was published to.
    pub async fn pattern_subscribe(&self, pattern: &str) -> Result<PatternSubscription> {
        if pattern.trim().is_empty() {
            return Err(Error::Validation("pattern must not be empty".to_string()));
        }
        self.open_subscription(
            SubscriptionTarget::Pattern(pattern.to_string()),
            decode_with_topic,
        )
        .await
    }

    async fn open_subscription<T: Send + 'static>(
        &self,
        target: SubscriptionTarget,
        decode: fn(&RawMessage) -> Result<T>,
    ) -> Result<Subscription<T>> {
        let handles = self.listener_handles()?;
        let session = handles
            .conn
            .open_session(target.clone())
            .await
            .map_err(|e| match e {
                Error::Validation(_) => e,
                other => into_connection_error(other),
            })?;

        let label = target.as_str().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(listen(
            session,
            label.clone(),
            handles.shutdown,
            cancel_rx,
            tx,
            decode,
            handles.alive,
        ));

        info!(
            subscription = %label,
            pattern = matches!(target, SubscriptionTarget::Pattern(_)),
            "Subscribed"
        );
        Ok(Subscription {
            target: label,
            rx,
            cancel: Some(cancel_tx),
            task: Some(task),
        })
    }

    /// Store a JSON-serialized value under `key` for `ttl_seconds`.
    pub async fn set_with_expiry<T>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let conn = self.connection()?;
        if ttl_seconds == 0 {
            return Err(Error::ExpiryStore("ttl must be greater than zero".to_string()));
        }

        let encoded = serde_json::to_string(value)
            .map_err(|e| Error::ExpiryStore(format!("cannot encode value for '{}': {}", key, e)))?;
        conn.set_with_expiry(key, &encoded, Duration::from_secs(ttl_seconds))
            .await
            .map_err(into_expiry_error)?;
        debug!(key, ttl_seconds, "Stored value with expiry");
        Ok(())
    }

    pub async fn set_with_default_expiry<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.set_with_expiry(key, value, self.default_ttl_seconds)
            .await
    }

    /// Fetch a stored value; `None` once it has expired or never existed.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.connection()?;
        let Some(raw) = conn.get(key).await.map_err(into_expiry_error)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            Error::ExpiryStore(format!("stored value for '{}' is not valid JSON: {}", key, e))
        })
    }

    /// Remove a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.connection()?;
        conn.delete(key).await.map_err(into_expiry_error)
    }

    /// Keep an envelope in the TTL store so replies can be matched against it.
    pub async fn stash_envelope(&self, envelope: &MessageEnvelope, ttl_seconds: u64) -> Result<()> {
        self.set_with_expiry(&envelope_key(&envelope.id), envelope, ttl_seconds)
            .await
    }

    pub async fn fetch_envelope(&self, id: &str) -> Result<Option<MessageEnvelope>> {
        self.get(&envelope_key(id)).await
    }

    /// Topics with at least one exact subscriber. Best effort.
    pub async fn list_channels(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        match conn.channels().await {
            Ok(channels) => Ok(channels),
            Err(e) => {
                warn!(error = %e, "Failed to list channels");
                Ok(Vec::new())
            }
        }
    }

    /// Exact subscribers of a topic. Best effort.
    pub async fn subscriber_count(&self, channel: &str) -> Result<usize> {
        let conn = self.connection()?;
        match conn.subscriber_count(channel).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!(channel, error = %e, "Failed to count subscribers");
                Ok(0)
            }
        }
    }
}

fn envelope_key(id: &str) -> String {
    format!("{}{}", ENVELOPE_KEY_PREFIX, id)
}

fn into_connection_error(e: Error) -> Error {
    match e {
        Error::Connection(_) => e,
        other => Error::Connection(other.to_string()),
    }
}

// Losing the transport stays a connection error so callers can reconnect.
fn into_expiry_error(e: Error) -> Error {
    match e {
        Error::ExpiryStore(_) | Error::Connection(_) | Error::NotConnected => e,
        other => Error::ExpiryStore(other.to_string()),
    }
}

fn decode_envelope(raw: &RawMessage) -> Result<MessageEnvelope> {
    MessageEnvelope::from_json(&raw.payload).map_err(|e| Error::Decode {
        topic: raw.channel.clone(),
        reason: e.to_string(),
    })
}

fn decode_with_topic(raw: &RawMessage) -> Result<(String, MessageEnvelope)> {
    decode_envelope(raw).map(|envelope| (raw.channel.clone(), envelope))
}

async fn listen<T>(
    mut session: Box<dyn Session>,
    target: String,
    mut shutdown: watch::Receiver<bool>,
    mut cancel: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<Result<T>>,
    decode: fn(&RawMessage) -> Result<T>,
    _alive: mpsc::Sender<()>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = &mut cancel => break,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tx.closed() => break,
            frame = session.next_message() => match frame {
                Ok(raw) => match decode(&raw) {
                    Ok(item) => {
                        if tx.send(Ok(item)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(subscription = %target, error = %e, "Skipping malformed message"),
                },
                Err(e) => {
                    error!(subscription = %target, error = %e, "Subscription lost its connection");
                    let _ = tx.send(Err(into_connection_error(e)));
                    break;
                }
            },
        }
    }

    if let Err(e) = session.unsubscribe().await {
        warn!(subscription = %target, error = %e, "Unsubscribe failed");
    }
    if let Err(e) = session.close().await {
        warn!(subscription = %target, error = %e, "Closing subscription session failed");
    }
    info!(subscription = %target, "Unsubscribed");
}

/// Live subscription stream.
///
/// Yields `Ok` items until cancelled, dropped or disconnected. A lost
/// transport session yields one `Err(Error::Connection)` and then ends.
/// Cannot be restarted; subscribe again instead.
pub struct Subscription<T> {
    target: String,
    rx: mpsc::UnboundedReceiver<Result<T>>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

pub type TopicSubscription = Subscription<MessageEnvelope>;
pub type PatternSubscription = Subscription<(String, MessageEnvelope)>;

impl<T> Subscription<T> {
    /// Topic or pattern this subscription listens on.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    /// Stop listening and wait until the session is unsubscribed and closed.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(subscription = %self.target, error = %e, "Subscription listener panicked");
            }
        }
    }
}

impl<T> Unpin for Subscription<T> {}

impl<T> Stream for Subscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
