//! Control-channel client (§4.5).
//!
//! An MQTT-shaped pub/sub facade: topics are plain strings, subscriptions are
//! substring filters (a handler registered for `"table/update"` fires for
//! `"table/update/my-app.ns"`), and the subscription registry is kept
//! independent of connection state so a reconnect can simply replay it.
//!
//! [`LocalControlChannel`] is the in-process broker used by this node's own
//! components to talk to each other and by tests; a real deployment swaps in
//! an implementation backed by an external broker without the rest of the
//! crate noticing, since everything depends on the [`ControlChannel`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;

/// Called with `(topic, payload)` for every message whose topic matches a
/// registered filter.
pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, topic_filter: &str, handler: Handler) -> Result<()>;
    async fn unsubscribe(&self, topic_filter: &str) -> Result<()>;
}

struct Subscription {
    filter: String,
    handler: Handler,
}

/// In-process pub/sub bus. Dispatch is O(subscribers) per publish, which is
/// fine at this node's topic volume (table updates, interest, registration).
pub struct LocalControlChannel {
    subscriptions: Mutex<Vec<Subscription>>,
    publish_counts: Mutex<HashMap<String, usize>>,
}

impl LocalControlChannel {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            publish_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Test/diagnostic helper: how many times has a topic containing
    /// `needle` been published?
    pub fn publish_count(&self, needle: &str) -> usize {
        self.publish_counts
            .lock()
            .iter()
            .filter(|(topic, _)| topic.contains(needle))
            .map(|(_, count)| *count)
            .sum()
    }

    /// Replays every live subscription against the transport. A real broker
    /// backend calls this after a reconnect; the local bus doesn't need it
    /// since subscriptions never actually detach, but the entry point exists
    /// so callers can treat reconnect uniformly.
    pub fn resubscribe_all(&self) {
        let count = self.subscriptions.lock().len();
        debug!(count, "replaying control-channel subscriptions");
    }
}

impl Default for LocalControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlChannel for LocalControlChannel {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        *self
            .publish_counts
            .lock()
            .entry(topic.to_string())
            .or_insert(0) += 1;

        let matching: Vec<Handler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| topic.contains(s.filter.as_str()))
            .map(|s| s.handler.clone())
            .collect();

        trace!(topic, matched = matching.len(), "dispatching control-channel message");
        for handler in matching {
            handler(topic, payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, handler: Handler) -> Result<()> {
        let mut guard = self.subscriptions.lock();
        guard.retain(|s| s.filter != topic_filter);
        guard.push(Subscription {
            filter: topic_filter.to_string(),
            handler,
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        self.subscriptions.lock().retain(|s| s.filter != topic_filter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn substring_filter_matches_suffixed_topics() {
        let bus = LocalControlChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe("table/update", Arc::new(move |_t, _p| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        bus.publish("table/update/my-app.ns", b"{}").await.unwrap();
        bus.publish("unrelated/topic", b"{}").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_dispatch() {
        let bus = LocalControlChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe("interest/add", Arc::new(move |_t, _p| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        bus.publish("interest/add", b"job").await.unwrap();
        bus.unsubscribe("interest/add").await.unwrap();
        bus.publish("interest/add", b"job").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubscribing_same_filter_replaces_not_duplicates() {
        let bus = LocalControlChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let hits3 = hits.clone();

        bus.subscribe("x", Arc::new(move |_t, _p| { hits2.fetch_add(1, Ordering::SeqCst); })).await.unwrap();
        bus.subscribe("x", Arc::new(move |_t, _p| { hits3.fetch_add(10, Ordering::SeqCst); })).await.unwrap();

        bus.publish("x", b"").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
