//! Pipeline event bus.
//!
//! Observers either register an async [`EventHandler`] for one topic or take
//! a passive broadcast receiver from [`EventBus::watch`]. Neither sits on the
//! data path between modules: a failing handler is logged and ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        target: String,
        modules: Vec<String>,
        at: DateTime<Utc>,
    },
    RunFinished {
        target: String,
        completed: usize,
        errored: usize,
        at: DateTime<Utc>,
    },
    ModuleStarted {
        module: String,
        at: DateTime<Utc>,
    },
    ModuleCompleted {
        module: String,
        duration_secs: f64,
        at: DateTime<Utc>,
    },
    ModuleFailed {
        module: String,
        error: String,
        at: DateTime<Utc>,
    },
    ToolInvoked {
        module: String,
        tool: String,
        outcome: String,
        cached: bool,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            PipelineEvent::RunStarted { .. } => EventTopic::RunStarted,
            PipelineEvent::RunFinished { .. } => EventTopic::RunFinished,
            PipelineEvent::ModuleStarted { .. } => EventTopic::ModuleStarted,
            PipelineEvent::ModuleCompleted { .. } => EventTopic::ModuleCompleted,
            PipelineEvent::ModuleFailed { .. } => EventTopic::ModuleFailed,
            PipelineEvent::ToolInvoked { .. } => EventTopic::ToolInvoked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    RunStarted,
    RunFinished,
    ModuleStarted,
    ModuleCompleted,
    ModuleFailed,
    ToolInvoked,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &PipelineEvent) -> anyhow::Result<()>;
}

/// Id returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type HandlerMap = HashMap<EventTopic, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>;

pub struct EventBus {
    handlers: RwLock<HandlerMap>,
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            handlers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    pub async fn subscribe(&self, topic: EventTopic, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.handlers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push((id, handler));
        debug!(topic = ?topic, "Event handler subscribed");
        id
    }

    /// Remove a handler. Returns false if the id was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().await;
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Passive receiver for every event emitted from now on.
    pub fn watch(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to the handlers of its topic, in subscription order,
    /// then to watchers.
    pub async fn emit(&self, event: PipelineEvent) {
        let topic = event.topic();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(&topic)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                warn!(topic = ?topic, error = %e, "Event handler failed");
            }
        }

        // No receivers is normal.
        let _ = self.sender.send(event);
    }

    pub async fn handler_count(&self, topic: EventTopic) -> usize {
        self.handlers
            .read()
            .await
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn clear(&self) {
        self.handlers.write().await.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
            anyhow::bail!("observer is broken")
        }
    }

    fn started(module: &str) -> PipelineEvent {
        PipelineEvent::ModuleStarted {
            module: module.into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_handlers_receive_only_their_topic() {
        let bus = EventBus::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe(EventTopic::ModuleStarted, counter.clone()).await;

        bus.emit(started("discovery")).await;
        bus.emit(PipelineEvent::ModuleFailed {
            module: "discovery".into(),
            error: "boom".into(),
            at: Utc::now(),
        })
        .await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe(EventTopic::ModuleStarted, Arc::new(Failing)).await;
        bus.subscribe(EventTopic::ModuleStarted, counter.clone()).await;

        bus.emit(started("dns_analysis")).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = bus.subscribe(EventTopic::ModuleStarted, counter.clone()).await;

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        assert_eq!(bus.handler_count(EventTopic::ModuleStarted).await, 0);

        bus.emit(started("discovery")).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_watchers_see_every_event() {
        let bus = EventBus::default();
        let mut rx = bus.watch();

        bus.emit(started("discovery")).await;
        bus.emit(started("web_probing")).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic(), EventTopic::ModuleStarted);
        assert!(matches!(second, PipelineEvent::ModuleStarted { ref module, .. } if module == "web_probing"));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(started("discovery")).unwrap();
        assert_eq!(json["event"], "module_started");
        assert_eq!(json["module"], "discovery");
    }
}
