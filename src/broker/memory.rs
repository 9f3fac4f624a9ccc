//! In-process transport.
//!
//! Behaves like a single Redis server shared by every connection made from
//! the same [`MemoryTransport`] (or its clones): publish counts include
//! pattern sessions, channel introspection only sees exact subscriptions, and
//! the TTL store expires keys on the tokio clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use super::transport::{Connection, RawMessage, Session, SubscriptionTarget, Transport};
use crate::error::{Error, Result};

type SessionId = u64;

struct SessionEntry {
    target: SubscriptionTarget,
    matcher: Option<glob::Pattern>,
    sender: mpsc::UnboundedSender<RawMessage>,
}

impl SessionEntry {
    fn matches(&self, topic: &str) -> bool {
        match (&self.target, &self.matcher) {
            (SubscriptionTarget::Topic(t), _) => t == topic,
            (SubscriptionTarget::Pattern(_), Some(pattern)) => pattern.matches(topic),
            (SubscriptionTarget::Pattern(_), None) => false,
        }
    }
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

struct Hub {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    store: Mutex<HashMap<String, StoredValue>>,
    next_session_id: AtomicU64,
    reachable: AtomicBool,
}

impl Hub {
    fn deliver(&self, topic: &str, payload: &str) -> usize {
        let sessions = self.sessions.read();
        sessions
            .values()
            .filter(|session| session.matches(topic))
            .filter(|session| {
                session
                    .sender
                    .send(RawMessage {
                        channel: topic.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok()
            })
            .count()
    }

    fn remove_session(&self, id: SessionId) -> bool {
        self.sessions.write().remove(&id).is_some()
    }
}

/// Rewrite a Redis-style glob into `glob::Pattern` syntax.
///
/// Redis negates classes with `[^..]` and escapes with `\`, and `**` is just
/// `*`. `glob` uses `[!..]`, has no escapes and reserves `**`.
fn translate_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) if !in_class => {
                    out.push('[');
                    out.push(escaped);
                    out.push(']');
                }
                Some(escaped) => out.push(escaped),
                None => out.push_str("[\\]"),
            },
            '*' if !in_class => {
                out.push('*');
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            other => out.push(other),
        }
    }
    out
}

/// Shared in-process pub/sub hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                sessions: RwLock::new(HashMap::new()),
                store: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    /// Publish an arbitrary frame, bypassing envelope serialization.
    ///
    /// Useful for feeding frames from producers that do not speak the
    /// envelope format.
    pub fn publish_raw(&self, topic: &str, payload: &str) -> usize {
        self.hub.deliver(topic, payload)
    }

    /// Simulate the transport going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.hub.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every live session as a lost server would.
    pub fn sever_sessions(&self) -> usize {
        let mut sessions = self.hub.sessions.write();
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Live sessions, exact and pattern.
    pub fn session_count(&self) -> usize {
        self.hub.sessions.read().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        if !self.hub.reachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory transport unreachable".to_string()));
        }
        Ok(Arc::new(MemoryConnection {
            hub: Arc::clone(&self.hub),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    hub: Arc<Hub>,
    open: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection closed".to_string()));
        }
        if !self.hub.reachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory transport unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize> {
        self.check()?;
        Ok(self.hub.deliver(topic, payload))
    }

    async fn open_session(&self, target: SubscriptionTarget) -> Result<Box<dyn Session>> {
        self.check()?;

        let matcher = match &target {
            SubscriptionTarget::Topic(_) => None,
            SubscriptionTarget::Pattern(pattern) => Some(
                glob::Pattern::new(&translate_pattern(pattern)).map_err(|e| {
                    Error::Validation(format!("Invalid pattern '{}': {}", pattern, e))
                })?,
            ),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.hub.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.hub.sessions.write().insert(
            id,
            SessionEntry {
                target: target.clone(),
                matcher,
                sender,
            },
        );
        trace!(session = id, topic = target.as_str(), "Opened memory session");

        Ok(Box::new(MemorySession {
            id,
            hub: Arc::clone(&self.hub),
            receiver,
        }))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        if ttl.is_zero() {
            return Err(Error::ExpiryStore("ttl must be positive".to_string()));
        }

        let now = Instant::now();
        let mut store = self.hub.store.lock();
        store.retain(|_, stored| stored.expires_at > now);
        store.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;

        let mut store = self.hub.store.lock();
        match store.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.value.clone())),
            Some(_) => {
                store.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;

        let removed = self.hub.store.lock().remove(key);
        Ok(removed.is_some_and(|stored| stored.expires_at > Instant::now()))
    }

    async fn channels(&self) -> Result<Vec<String>> {
        self.check()?;

        let sessions = self.hub.sessions.read();
        let channels: BTreeSet<String> = sessions
            .values()
            .filter_map(|session| match &session.target {
                SubscriptionTarget::Topic(topic) => Some(topic.clone()),
                SubscriptionTarget::Pattern(_) => None,
            })
            .collect();
        Ok(channels.into_iter().collect())
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize> {
        self.check()?;

        let sessions = self.hub.sessions.read();
        Ok(sessions
            .values()
            .filter(|session| matches!(&session.target, SubscriptionTarget::Topic(t) if t == channel))
            .count())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySession {
    id: SessionId,
    hub: Arc<Hub>,
    receiver: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
impl Session for MemorySession {
    async fn next_message(&mut self) -> Result<RawMessage> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| Error::Connection("memory session severed".to_string()))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.hub.remove_session(self.id) {
            trace!(session = self.id, "Removed memory session");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver.close();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.hub.remove_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_counts_matching_sessions() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        assert_eq!(conn.publish("agent:a:tasks", "{}").await.unwrap(), 0);

        let mut exact = conn
            .open_session(SubscriptionTarget::Topic("agent:a:tasks".into()))
            .await
            .unwrap();
        let mut pattern = conn
            .open_session(SubscriptionTarget::Pattern("agent:a:*".into()))
            .await
            .unwrap();

        assert_eq!(conn.publish("agent:a:tasks", "one").await.unwrap(), 2);
        assert_eq!(conn.publish("agent:a:status", "two").await.unwrap(), 1);
        assert_eq!(conn.publish("agent:b:tasks", "three").await.unwrap(), 0);

        assert_eq!(exact.next_message().await.unwrap().payload, "one");
        let first = pattern.next_message().await.unwrap();
        let second = pattern.next_message().await.unwrap();
        assert_eq!(first.channel, "agent:a:tasks");
        assert_eq!(second.channel, "agent:a:status");
    }

    #[tokio::test]
    async fn test_introspection_sees_exact_only() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        let _a = conn.open_session(SubscriptionTarget::Topic("results:t1".into())).await.unwrap();
        let _b = conn.open_session(SubscriptionTarget::Topic("results:t1".into())).await.unwrap();
        let _c = conn.open_session(SubscriptionTarget::Pattern("results:*".into())).await.unwrap();

        assert_eq!(conn.channels().await.unwrap(), vec!["results:t1"]);
        assert_eq!(conn.subscriber_count("results:t1").await.unwrap(), 2);
        assert_eq!(conn.subscriber_count("results:t2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_remove_session() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        let mut session = conn.open_session(SubscriptionTarget::Topic("x".into())).await.unwrap();
        let other = conn.open_session(SubscriptionTarget::Topic("x".into())).await.unwrap();
        assert_eq!(transport.session_count(), 2);

        session.unsubscribe().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(transport.session_count(), 1);

        drop(other);
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        let result = conn.open_session(SubscriptionTarget::Pattern("agent:[a".into())).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_translate_redis_glob() {
        assert_eq!(translate_pattern("agent:A:*"), "agent:A:*");
        assert_eq!(translate_pattern("agent:**"), "agent:*");
        assert_eq!(translate_pattern("agent:[^B]:tasks"), "agent:[!B]:tasks");
        assert_eq!(translate_pattern(r"results:\*"), "results:[*]");
        assert_eq!(translate_pattern(r"results:\?x"), "results:[?]x");
    }

    #[tokio::test]
    async fn test_redis_glob_syntax() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        let negated = conn
            .open_session(SubscriptionTarget::Pattern("agent:[^B]:tasks".into()))
            .await
            .unwrap();
        assert_eq!(conn.publish("agent:A:tasks", "x").await.unwrap(), 1);
        assert_eq!(conn.publish("agent:B:tasks", "x").await.unwrap(), 0);
        drop(negated);

        let escaped = conn
            .open_session(SubscriptionTarget::Pattern(r"results:\*".into()))
            .await
            .unwrap();
        assert_eq!(conn.publish("results:*", "x").await.unwrap(), 1);
        assert_eq!(conn.publish("results:t1", "x").await.unwrap(), 0);
        drop(escaped);

        let _double = conn
            .open_session(SubscriptionTarget::Pattern("agent:**".into()))
            .await
            .unwrap();
        assert_eq!(conn.publish("agent:A:status", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_severed_session_errors() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        let mut session = conn.open_session(SubscriptionTarget::Topic("x".into())).await.unwrap();

        assert_eq!(transport.sever_sessions(), 1);
        assert!(matches!(session.next_message().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        transport.set_reachable(false);
        assert!(transport.connect().await.is_err());
        assert!(matches!(conn.publish("x", "y").await, Err(Error::Connection(_))));

        transport.set_reachable(true);
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(conn.get("k").await, Err(Error::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_store_expires() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        conn.set_with_expiry("k", "v", Duration::from_secs(2)).await.unwrap();
        assert_eq!(conn.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert_eq!(conn.get("k").await.unwrap(), None);
        assert!(!conn.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_store_rejects_zero_ttl() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        let result = conn.set_with_expiry("k", "v", Duration::ZERO).await;
        assert!(matches!(result, Err(Error::ExpiryStore(_))));
    }
}
