//! Redis transport.
//!
//! Publishing, introspection and the TTL store share one multiplexed
//! connection. Each subscription gets its own pub/sub connection, as Redis
//! requires.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{Client, RedisError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;

use super::transport::{Connection, RawMessage, Session, SubscriptionTarget, Transport};
use crate::error::{Error, Result};

fn connection_error(e: RedisError) -> Error {
    Error::Connection(e.to_string())
}

// A dropped or refused connection stays a connection error; anything else is the store's.
fn store_error(e: RedisError) -> Error {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        connection_error(e)
    } else {
        Error::ExpiryStore(e.to_string())
    }
}

pub struct RedisTransport {
    client: Client,
}

impl RedisTransport {
    /// Validate the URL; nothing is dialed until [`Transport::connect`].
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| Error::Config(format!("Invalid redis url '{}': {}", url, e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        debug!("Opened redis connection");
        Ok(Arc::new(RedisConnection {
            client: self.client.clone(),
            conn: Mutex::new(Some(conn)),
        }))
    }
}

struct RedisConnection {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnection {
    // Multiplexed connections are cheap handles; clone one out per command.
    fn handle(&self) -> Result<MultiplexedConnection> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.handle()?;
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize> {
        let mut conn = self.handle()?;
        let receivers: usize = ::redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;
        Ok(receivers)
    }

    async fn open_session(&self, target: SubscriptionTarget) -> Result<Box<dyn Session>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(connection_error)?;
        match &target {
            SubscriptionTarget::Topic(topic) => pubsub.subscribe(topic.as_str()).await,
            SubscriptionTarget::Pattern(pattern) => pubsub.psubscribe(pattern.as_str()).await,
        }
        .map_err(connection_error)?;

        Ok(Box::new(RedisSession {
            target,
            pubsub: Some(pubsub),
        }))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.handle()?;
        let seconds = ttl.as_secs();
        if seconds == 0 {
            return Err(Error::ExpiryStore("ttl must be at least one second".to_string()));
        }
        let _: () = ::redis::cmd("SETEX")
            .arg(key)
            .arg(seconds)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.handle()?;
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.handle()?;
        let removed: usize = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn channels(&self) -> Result<Vec<String>> {
        let mut conn = self.handle()?;
        let mut channels: Vec<String> = ::redis::cmd("PUBSUB")
            .arg("CHANNELS")
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;
        channels.sort();
        Ok(channels)
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize> {
        let mut conn = self.handle()?;
        let (_, count): (String, usize) = ::redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        self.conn.lock().take();
        Ok(())
    }
}

struct RedisSession {
    target: SubscriptionTarget,
    pubsub: Option<PubSub>,
}

#[async_trait]
impl Session for RedisSession {
    async fn next_message(&mut self) -> Result<RawMessage> {
        let pubsub = self
            .pubsub
            .as_mut()
            .ok_or_else(|| Error::Connection("session closed".to_string()))?;
        let message = pubsub
            .on_message()
            .next()
            .await
            .ok_or_else(|| Error::Connection("redis pub/sub connection lost".to_string()))?;

        let channel = message.get_channel_name().to_string();
        // Non-UTF-8 payloads surface as an undecodable frame, not a lost session
        let payload: String = message
            .get_payload()
            .unwrap_or_else(|_| String::from_utf8_lossy(message.get_payload_bytes()).into_owned());
        Ok(RawMessage { channel, payload })
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        let Some(pubsub) = self.pubsub.as_mut() else {
            return Ok(());
        };
        match &self.target {
            SubscriptionTarget::Topic(topic) => pubsub.unsubscribe(topic.as_str()).await,
            SubscriptionTarget::Pattern(pattern) => pubsub.punsubscribe(pattern.as_str()).await,
        }
        .map_err(connection_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.pubsub.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::ErrorKind;

    #[test]
    fn test_store_error_keeps_lost_connection() {
        let dropped = RedisError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(store_error(dropped), Error::Connection(_)));

        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(store_error(wrong_type), Error::ExpiryStore(_)));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(RedisTransport::new("not a url"), Err(Error::Config(_))));
    }
}
