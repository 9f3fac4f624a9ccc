//! Transport abstraction the broker runs on.
//!
//! A [`Transport`] hands out a [`Connection`] for publishing, introspection
//! and the keyed TTL store. Every subscription gets its own [`Session`] so a
//! stalled consumer only ever stalls itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// What a session listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Exactly one topic.
    Topic(String),
    /// Every topic matching a glob pattern.
    Pattern(String),
}

impl SubscriptionTarget {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionTarget::Topic(topic) => topic,
            SubscriptionTarget::Pattern(pattern) => pattern,
        }
    }
}

/// One undecoded frame received on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Concrete topic the frame was published to.
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open the primary connection.
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Publish a frame; returns how many sessions it was handed to.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize>;

    /// Open a dedicated session already subscribed to `target`.
    ///
    /// Frames published after this returns are buffered for the session.
    async fn open_session(&self, target: SubscriptionTarget) -> Result<Box<dyn Session>>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Topics with at least one exact subscriber.
    async fn channels(&self) -> Result<Vec<String>>;

    /// Exact subscribers of a topic (pattern sessions are not counted).
    async fn subscriber_count(&self, channel: &str) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Session: Send {
    /// Wait for the next frame. An error means the session is gone for good.
    async fn next_message(&mut self) -> Result<RawMessage>;

    async fn unsubscribe(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
