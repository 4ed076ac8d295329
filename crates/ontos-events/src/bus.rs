use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use ontos_protocol::{DomainEvent, OntosResult};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

/// Subscription key that receives every event.
pub const ALL_EVENTS: &str = "*";

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &DomainEvent) -> OntosResult<()>;
}

type HandlerFn = dyn Fn(DomainEvent) -> BoxFuture<'static, OntosResult<()>> + Send + Sync;

/// Adapts a closure into an [`EventHandler`].
pub struct FnHandler {
    name: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DomainEvent) -> BoxFuture<'static, OntosResult<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> OntosResult<()> {
        (self.f)(event.clone()).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// In-process event bus.
///
/// Handlers run in subscription order and are awaited before `publish`
/// returns. A failing handler is logged and does not stop the others.
pub struct EventBus {
    handlers: RwLock<IndexMap<String, Vec<Arc<dyn EventHandler>>>>,
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self {
            handlers: RwLock::new(IndexMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self, event_name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_name = event_name.into();
        debug!(event = %event_name, handler = handler.name(), "event handler subscribed");
        self.handlers
            .write()
            .entry(event_name)
            .or_default()
            .push(handler);
    }

    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.subscribe(ALL_EVENTS, handler);
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.read().get(event_name).map_or(0, Vec::len)
    }

    fn handlers_for(&self, event_name: &str) -> Vec<Arc<dyn EventHandler>> {
        let guard = self.handlers.read();
        let named = guard.get(event_name).into_iter().flatten();
        let wildcard = guard.get(ALL_EVENTS).into_iter().flatten();
        named.chain(wildcard).cloned().collect()
    }

    #[instrument(skip(self, event), fields(event = %event.name, action = %event.action))]
    pub async fn publish(&self, event: DomainEvent) -> PublishReport {
        let mut report = PublishReport::default();
        for handler in self.handlers_for(&event.name) {
            match handler.handle(&event).await {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(handler = handler.name(), %error, "event handler failed");
                }
            }
        }
        let _ = self.sender.send(event);
        debug!(delivered = report.delivered, failed = report.failed, "event published");
        report
    }

    pub fn stream(&self) -> BroadcastStream<DomainEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use ontos_protocol::OntosError;
    use parking_lot::Mutex;

    fn recorder(name: &str, seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
        let label = name.to_owned();
        Arc::new(FnHandler::new(name, move |event: DomainEvent| {
            seen.lock().push(format!("{label}:{}", event.name));
            async { Ok(()) }.boxed()
        }))
    }

    #[tokio::test]
    async fn named_then_wildcard_handlers_run() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder("audit", seen.clone()));
        bus.subscribe("GUEST_CHECKED_IN", recorder("housekeeping", seen.clone()));

        let report = bus
            .publish(DomainEvent::new("GUEST_CHECKED_IN", "walkin_checkin", "u1"))
            .await;
        assert_eq!(report.delivered, 2);
        assert_eq!(
            *seen.lock(),
            vec!["housekeeping:GUEST_CHECKED_IN", "audit:GUEST_CHECKED_IN"]
        );

        bus.publish(DomainEvent::new("TASK_CREATED", "create_task", "u1")).await;
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "PAYMENT_RECEIVED",
            Arc::new(FnHandler::new("broken", |_| {
                async { Err(OntosError::upstream("in_app", "down")) }.boxed()
            })),
        );
        bus.subscribe("PAYMENT_RECEIVED", recorder("ok", seen.clone()));

        let report = bus
            .publish(DomainEvent::new("PAYMENT_RECEIVED", "add_payment", "u1"))
            .await;
        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.receiver();
        bus.publish(DomainEvent::new("ROOM_CHANGED", "change_room", "u1")).await;
        let event = rx.recv().await.map_err(|e| e.to_string());
        assert_eq!(event.map(|e| e.name), Ok("ROOM_CHANGED".to_owned()));
    }
}
