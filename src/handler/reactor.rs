//! Reactor handler: event-driven automation.
//!
//! A reactor consumes committed events, runs domain reaction logic, and
//! appends any resulting events back to the store, closing the loop. The
//! handler stages the reactor's whole output and commits it with one atomic
//! save — either every produced event lands or none does. Because a save
//! batch targets a single aggregate, one reaction's output must share an
//! aggregate; cross-aggregate reactions are separate reactions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Error;
use crate::event::Event;
use crate::handler::EventHandler;
use crate::store::EventStore;

/// Domain reaction logic: consumes one event, emits zero or more new ones.
#[async_trait]
pub trait Reactor: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<Vec<Event>, Error>;
}

/// Terminal handler wrapping a [`Reactor`] and appending its output to the
/// store.
pub struct ReactorHandler {
    reactor: Arc<dyn Reactor>,
    store: Arc<dyn EventStore>,
}

impl ReactorHandler {
    pub fn new(reactor: Arc<dyn Reactor>, store: Arc<dyn EventStore>) -> Self {
        Self { reactor, store }
    }
}

#[async_trait]
impl EventHandler for ReactorHandler {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        let produced = self.reactor.handle_event(event).await?;
        if produced.is_empty() {
            return Ok(());
        }

        debug!(count = produced.len(), "appending reactor output to store");
        self.store.save(produced).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StoreQuery;
    use crate::store::InMemoryStore;
    use futures::TryStreamExt;
    use uuid::Uuid;

    /// Reacts to `UserCreated` by granting a default role binding.
    struct RoleBindingReactor {
        binding_id: Uuid,
    }

    #[async_trait]
    impl Reactor for RoleBindingReactor {
        async fn handle_event(&self, event: Event) -> Result<Vec<Event>, Error> {
            if event.event_type() != "UserCreated" {
                return Ok(vec![]);
            }
            Ok(vec![
                Event::new(
                    "UserRoleBindingCreated",
                    "UserRoleBinding",
                    self.binding_id,
                    0,
                ),
            ])
        }
    }

    struct FailingReactor;

    #[async_trait]
    impl Reactor for FailingReactor {
        async fn handle_event(&self, _event: Event) -> Result<Vec<Event>, Error> {
            Err(Error::Reactor("role lookup failed".into()))
        }
    }

    #[tokio::test]
    async fn appends_produced_events_to_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let binding_id = Uuid::new_v4();
        let handler = ReactorHandler::new(
            Arc::new(RoleBindingReactor { binding_id }),
            store.clone(),
        );

        handler
            .handle(Event::new("UserCreated", "User", Uuid::new_v4(), 0))
            .await
            .unwrap();

        let appended: Vec<Event> = store
            .load(StoreQuery::builder().aggregate_id(binding_id).build())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].event_type(), "UserRoleBindingCreated");
    }

    #[tokio::test]
    async fn no_output_appends_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let handler = ReactorHandler::new(
            Arc::new(RoleBindingReactor {
                binding_id: Uuid::new_v4(),
            }),
            store.clone(),
        );

        handler
            .handle(Event::new("UserRenamed", "User", Uuid::new_v4(), 1))
            .await
            .unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reactor_errors_propagate_and_nothing_is_committed() {
        let store = Arc::new(InMemoryStore::new());
        let handler = ReactorHandler::new(Arc::new(FailingReactor), store.clone());

        let result = handler
            .handle(Event::new("UserCreated", "User", Uuid::new_v4(), 0))
            .await;

        assert!(matches!(result, Err(Error::Reactor(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn conflicting_append_surfaces_to_the_consumer() {
        let store = Arc::new(InMemoryStore::new());
        let binding_id = Uuid::new_v4();
        store
            .save(vec![Event::new(
                "UserRoleBindingCreated",
                "UserRoleBinding",
                binding_id,
                0,
            )])
            .await
            .unwrap();

        let handler = ReactorHandler::new(
            Arc::new(RoleBindingReactor { binding_id }),
            store.clone(),
        );
        let result = handler
            .handle(Event::new("UserCreated", "User", Uuid::new_v4(), 0))
            .await;

        assert!(matches!(
            result,
            Err(Error::AggregateVersionAlreadyExists { .. })
        ));
    }
}
