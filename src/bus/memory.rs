//! In-process event bus.
//!
//! Fan-out over tokio channels: every consumer owns an unbounded queue and a
//! single worker task draining it. Handler failures are logged, not retried —
//! delivery is at-least-once and the consumer's middleware chain is
//! responsible for repairing whatever a lost or failed delivery leaves
//! behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::bus::EventBus;
use crate::error::Error;
use crate::event::{Event, EventMatcher, topic};
use crate::handler::EventHandler;

struct Consumer {
    name: String,
    matchers: Vec<EventMatcher>,
    sender: mpsc::UnboundedSender<Event>,
}

/// An in-process [`EventBus`].
///
/// # Examples
///
/// ```rust
/// use everlog::{EventBus, EventMatcher, InMemoryBus, LoggingMiddleware};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), everlog::Error> {
/// let bus = InMemoryBus::new("events");
/// bus.subscribe(
///     "audit",
///     vec![EventMatcher::any()],
///     Arc::new(LoggingMiddleware::terminal()),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub struct InMemoryBus {
    prefix: String,
    consumers: RwLock<Vec<Consumer>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            consumers: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The configured routing-key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: Event) -> Result<(), Error> {
        let topic = topic(&self.prefix, &event);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CouldNotPublish { topic });
        }

        let consumers = self.consumers.read().expect("consumer lock poisoned");
        for consumer in consumers.iter() {
            if consumer.matchers.iter().any(|m| m.matches(&event)) {
                debug!(consumer = %consumer.name, %topic, "routing event");
                if consumer.sender.send(event.clone()).is_err() {
                    return Err(Error::CouldNotPublish { topic });
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &str,
        matchers: Vec<EventMatcher>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CouldNotSubscribe {
                name: name.to_string(),
                reason: "bus is closed".to_string(),
            });
        }
        if matchers.is_empty() {
            return Err(Error::CouldNotSubscribe {
                name: name.to_string(),
                reason: "at least one matcher is required".to_string(),
            });
        }

        let mut consumers = self.consumers.write().expect("consumer lock poisoned");
        if consumers.iter().any(|c| c.name == name) {
            return Err(Error::CouldNotSubscribe {
                name: name.to_string(),
                reason: "consumer name already registered".to_string(),
            });
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        consumers.push(Consumer {
            name: name.to_string(),
            matchers,
            sender,
        });

        let worker_name = name.to_string();
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = handler.handle(event).await {
                    // At-least-once delivery: the handler chain owns repair,
                    // the bus only reports.
                    error!(consumer = %worker_name, error = %err, "event handler failed");
                }
            }
        });
        self.workers
            .lock()
            .expect("worker lock poisoned")
            .push(worker);

        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders lets each worker drain its queue and exit.
        self.consumers
            .write()
            .expect("consumer lock poisoned")
            .clear();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct RecordingHandler {
        delivered: mpsc::UnboundedSender<Event>,
    }

    fn recording_handler() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { delivered: tx }), rx)
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: Event) -> Result<(), Error> {
            self.delivered.send(event).expect("test receiver dropped");
            Ok(())
        }
    }

    fn user_event(event_type: &str, version: u64) -> Event {
        Event::new(event_type, "User", Uuid::new_v4(), version)
    }

    #[tokio::test]
    async fn routes_to_matching_consumers_only() {
        let bus = InMemoryBus::new("events");
        let (users, mut user_rx) = recording_handler();
        let (tenants, mut tenant_rx) = recording_handler();

        bus.subscribe(
            "users",
            vec![EventMatcher::any().match_aggregate_type("User")],
            users,
        )
        .await
        .unwrap();
        bus.subscribe(
            "tenants",
            vec![EventMatcher::any().match_aggregate_type("Tenant")],
            tenants,
        )
        .await
        .unwrap();

        bus.publish(user_event("UserCreated", 0)).await.unwrap();
        bus.close().await;

        assert_eq!(user_rx.recv().await.unwrap().event_type(), "UserCreated");
        assert!(tenant_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn wildcard_matcher_receives_everything() {
        let bus = InMemoryBus::new("events");
        let (all, mut rx) = recording_handler();
        bus.subscribe("all", vec![EventMatcher::any()], all)
            .await
            .unwrap();

        bus.publish(user_event("UserCreated", 0)).await.unwrap();
        bus.publish(Event::new("TenantCreated", "Tenant", Uuid::new_v4(), 0))
            .await
            .unwrap();
        bus.close().await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn multiple_matchers_deliver_once_per_event() {
        let bus = InMemoryBus::new("events");
        let (handler, mut rx) = recording_handler();
        bus.subscribe(
            "users",
            vec![
                EventMatcher::any().match_event_type("UserCreated"),
                EventMatcher::any().match_aggregate_type("User"),
            ],
            handler,
        )
        .await
        .unwrap();

        // Both matchers accept this event; it must still arrive exactly once
        // from a single publish.
        bus.publish(user_event("UserCreated", 0)).await.unwrap();
        bus.close().await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_consumer_name_is_rejected() {
        let bus = InMemoryBus::new("events");
        let (first, _rx1) = recording_handler();
        let (second, _rx2) = recording_handler();

        bus.subscribe("users", vec![EventMatcher::any()], first)
            .await
            .unwrap();
        let result = bus.subscribe("users", vec![EventMatcher::any()], second).await;
        assert!(matches!(result, Err(Error::CouldNotSubscribe { .. })));
    }

    #[tokio::test]
    async fn subscribing_without_matchers_is_rejected() {
        let bus = InMemoryBus::new("events");
        let (handler, _rx) = recording_handler();
        let result = bus.subscribe("users", vec![], handler).await;
        assert!(matches!(result, Err(Error::CouldNotSubscribe { .. })));
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = InMemoryBus::new("events");
        bus.close().await;
        let result = bus.publish(user_event("UserCreated", 0)).await;
        assert!(matches!(result, Err(Error::CouldNotPublish { .. })));
    }
}
