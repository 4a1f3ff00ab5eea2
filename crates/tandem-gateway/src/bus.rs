//! Cross-process fanout bus.
//!
//! Every server process subscribes to the topics of the rooms its local
//! connections have joined. A publish reaches every subscriber of the topic
//! on every process, including the publisher's own subscription; routers
//! recognise their own envelopes by `origin` and skip them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{self, BoxFuture};
use tracing::trace;

use tandem_types::error::ChatError;
use tandem_types::events::BusEnvelope;

pub type BusHandler = Arc<dyn Fn(BusEnvelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait FanoutBus: Send + Sync {
    /// Best-effort, at-most-once delivery to every subscriber of
    /// `envelope.topic`. An error means some peer may not have received it.
    fn publish(&self, envelope: BusEnvelope) -> BoxFuture<'_, Result<(), ChatError>>;

    fn subscribe(&self, topic: &str, handler: BusHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Hand an envelope that arrived from elsewhere to local subscribers.
    /// Returns how many handlers ran.
    fn ingest(&self, envelope: BusEnvelope) -> usize;

    fn kind(&self) -> &'static str;
}

/// Topic -> handlers, shared by the bus implementations.
#[derive(Default)]
pub struct TopicTable {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, BusHandler)>>>,
}

impl TopicTable {
    pub fn subscribe(&self, topic: &str, handler: BusHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        trace!("Bus subscription {:?} on {}", id, topic);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut topics = self.lock();
        topics.retain(|_, subs| {
            subs.retain(|(sub_id, _)| *sub_id != id);
            !subs.is_empty()
        });
    }

    /// Run every handler subscribed to the envelope's topic. Handlers are
    /// cloned out first so they may subscribe or unsubscribe themselves.
    pub fn deliver(&self, envelope: &BusEnvelope) -> usize {
        let handlers: Vec<BusHandler> = self
            .lock()
            .get(&envelope.topic)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(envelope.clone());
        }
        handlers.len()
    }

    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, BusHandler)>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process bus. Several routers sharing one `LocalBus` behave like
/// several server processes behind a real broker.
#[derive(Default)]
pub struct LocalBus {
    table: TopicTable,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_count(&self) -> usize {
        self.table.topic_count()
    }
}

impl FanoutBus for LocalBus {
    fn publish(&self, envelope: BusEnvelope) -> BoxFuture<'_, Result<(), ChatError>> {
        self.table.deliver(&envelope);
        Box::pin(future::ready(Ok(())))
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> SubscriptionId {
        self.table.subscribe(topic, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.table.unsubscribe(id)
    }

    fn ingest(&self, envelope: BusEnvelope) -> usize {
        self.table.deliver(&envelope)
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

/// Single-process deployments: nothing leaves the process, and local
/// delivery already happened in the router.
#[derive(Default)]
pub struct NoopBus {
    next_id: AtomicU64,
}

impl FanoutBus for NoopBus {
    fn publish(&self, _envelope: BusEnvelope) -> BoxFuture<'_, Result<(), ChatError>> {
        Box::pin(future::ready(Ok(())))
    }

    fn subscribe(&self, _topic: &str, _handler: BusHandler) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn ingest(&self, _envelope: BusEnvelope) -> usize {
        0
    }

    fn kind(&self) -> &'static str {
        "none"
    }
}
