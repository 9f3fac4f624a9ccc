//! In-process index of which local subscribers care about which channels.
//!
//! Pure bookkeeping: nothing here delivers messages. A fan-out component
//! (for example a bridge relaying bus traffic to connected clients) asks the
//! registry which of its subscriber ids should see a channel.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::trace;

/// `channel -> subscriber ids` in subscription order.
///
/// All methods take `&self`; share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: RwLock<BTreeMap<String, Vec<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pairing. Returns `false` if it already existed.
    pub fn subscribe(&self, subscriber_id: &str, channel: &str) -> bool {
        let mut channels = self.channels.write();
        let subscribers = channels.entry(channel.to_string()).or_default();
        if subscribers.iter().any(|s| s == subscriber_id) {
            return false;
        }
        subscribers.push(subscriber_id.to_string());
        trace!(subscriber_id, channel, "Registered subscription");
        true
    }

    /// Remove a pairing, dropping the channel once nobody is left on it.
    /// Returns whether the pairing existed.
    pub fn unsubscribe(&self, subscriber_id: &str, channel: &str) -> bool {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let Some(pos) = subscribers.iter().position(|s| s == subscriber_id) else {
            return false;
        };
        subscribers.remove(pos);
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        trace!(subscriber_id, channel, "Removed subscription");
        true
    }

    /// Subscribers of a channel, in the order they subscribed.
    pub fn get_subscribers(&self, channel: &str) -> Vec<String> {
        self.channels.read().get(channel).cloned().unwrap_or_default()
    }

    /// Channels a subscriber is on, sorted by channel name.
    pub fn get_subscriptions(&self, subscriber_id: &str) -> Vec<String> {
        self.channels
            .read()
            .iter()
            .filter(|(_, subscribers)| subscribers.iter().any(|s| s == subscriber_id))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn is_subscribed(&self, subscriber_id: &str, channel: &str) -> bool {
        self.channels
            .read()
            .get(channel)
            .is_some_and(|subscribers| subscribers.iter().any(|s| s == subscriber_id))
    }

    /// Remove every pairing for a subscriber. Returns how many were removed.
    pub fn clear_subscriber(&self, subscriber_id: &str) -> usize {
        let mut channels = self.channels.write();
        let mut removed = 0;
        channels.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s != subscriber_id);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        trace!(subscriber_id, removed, "Cleared subscriber");
        removed
    }

    /// Channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.subscribe("agent-001", "agent:tasks"));
        assert!(!registry.subscribe("agent-001", "agent:tasks"));
        assert_eq!(registry.subscriber_count("agent:tasks"), 1);
    }

    #[test]
    fn test_subscribers_keep_order() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c", "broadcast:system");
        registry.subscribe("a", "broadcast:system");
        registry.subscribe("b", "broadcast:system");
        assert_eq!(registry.get_subscribers("broadcast:system"), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_last_unsubscribe_prunes_channel() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("agent-001", "agent:tasks");
        assert!(registry.unsubscribe("agent-001", "agent:tasks"));
        assert!(registry.channels().is_empty());
        assert!(registry.get_subscribers("agent:tasks").is_empty());
        assert!(!registry.unsubscribe("agent-001", "agent:tasks"));
    }

    #[test]
    fn test_subscriptions_and_membership() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("ui-1", "workflow:w:updates");
        registry.subscribe("ui-1", "agent:a:status");
        registry.subscribe("ui-2", "agent:a:status");

        assert_eq!(
            registry.get_subscriptions("ui-1"),
            vec!["agent:a:status", "workflow:w:updates"]
        );
        assert!(registry.is_subscribed("ui-2", "agent:a:status"));
        assert!(!registry.is_subscribed("ui-2", "workflow:w:updates"));
    }

    #[test]
    fn test_clear_subscriber_prunes_empty_channels() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("ui-1", "workflow:w:updates");
        registry.subscribe("ui-1", "agent:a:status");
        registry.subscribe("ui-2", "agent:a:status");

        assert_eq!(registry.clear_subscriber("ui-1"), 2);
        assert_eq!(registry.channels(), vec!["agent:a:status"]);
        assert_eq!(registry.get_subscribers("agent:a:status"), vec!["ui-2"]);
        assert_eq!(registry.clear_subscriber("ui-1"), 0);
    }

    #[test]
    fn test_concurrent_subscribe() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.subscribe(&format!("sub-{}", i), "broadcast:system");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.subscriber_count("broadcast:system"), 8);
    }
}
