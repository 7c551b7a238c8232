//! An event-sourced backbone for CQRS systems: a durable, append-only event
//! log with per-aggregate optimistic concurrency, topic-routed
//! publish/subscribe distribution, and a consistency protocol that keeps
//! derived read-model projections synchronized with the log despite an
//! at-least-once, unordered-across-aggregates bus.
//!
//! The pieces compose like this: a writer [`commit`]s a batch of events —
//! the [`EventStore`] enforces version contiguity and uniqueness, then the
//! [`EventBus`] broadcasts the committed events to consumers. Each consumer
//! is a chain of middlewares around a terminal handler; the chain
//! reconstructs per-aggregate order and repairs gaps by querying the store
//! directly, so the store is both the system of record and the fallback
//! data source for the asynchronous side.
//!
//! # Examples
//!
//! ```rust,no_run
//! use everlog::{
//!     Event, EventMatcher, InMemoryBus, InMemoryProjectionRepository, InMemoryStore,
//!     ProjectionHandler, RefreshMiddleware, ReplayMiddleware, commit,
//! };
//! use std::sync::Arc;
//! use tokio::time::Duration;
//! # use everlog::{Error, EventBus, Projection, Projector};
//! # use async_trait::async_trait;
//! # use uuid::Uuid;
//! # #[derive(Clone)]
//! # struct User { id: Uuid, version: u64 }
//! # impl Projection for User {
//! #     fn id(&self) -> Uuid { self.id }
//! #     fn version(&self) -> u64 { self.version }
//! # }
//! # struct UserProjector;
//! # #[async_trait]
//! # impl Projector<User> for UserProjector {
//! #     async fn project(&self, event: Event, _previous: Option<User>) -> Result<Option<User>, Error> {
//! #         Ok(Some(User { id: event.aggregate_id(), version: event.aggregate_version() }))
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), everlog::Error> {
//! let store = Arc::new(InMemoryStore::new());
//! let bus = Arc::new(InMemoryBus::new("events"));
//!
//! // A projection consumer: refresh -> replay -> apply.
//! let repository = Arc::new(InMemoryProjectionRepository::new());
//! let apply = Arc::new(ProjectionHandler::new(Arc::new(UserProjector), repository));
//! let replay = Arc::new(ReplayMiddleware::new(store.clone(), apply));
//! let refresh = Arc::new(RefreshMiddleware::new(
//!     store.clone(),
//!     Duration::from_secs(30),
//!     replay,
//! ));
//! bus.subscribe(
//!     "user-projection",
//!     vec![EventMatcher::any().match_aggregate_type("User")],
//!     refresh,
//! )
//! .await?;
//!
//! // Append to the log, then broadcast.
//! let id = Uuid::new_v4();
//! commit(
//!     vec![Event::new("UserCreated", "User", id, 0)],
//!     store.as_ref(),
//!     bus.as_ref(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

mod bus;
mod config;
mod delay;
mod error;
mod event;
mod handler;
mod store;

pub use bus::{EventBus, InMemoryBus};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use delay::RetryDelay;
pub use error::Error;
pub use event::{Event, EventMatcher, EventRegistry, StoreQuery, StoreQueryBuilder, topic};
pub use handler::{
    EventHandler, InMemoryProjectionRepository, LoggingMiddleware, Projection, ProjectionHandler,
    ProjectionRepository, Projector, Reactor, ReactorHandler, RefreshMiddleware, ReplayMiddleware,
};
pub use store::{ConnectionState, EventStore, EventStream, InMemoryStore, PostgresStore};

/// Appends a batch of events to the store and, once committed, publishes
/// each of them on the bus.
///
/// Only events the store accepted are published; a save failure — including
/// the [`Error::AggregateVersionAlreadyExists`] conflict a losing concurrent
/// writer receives — publishes nothing. A publish failure after a successful
/// save is surfaced to the caller, but the events are durable at that point:
/// consumers will pick them up through their refresh middleware even if the
/// broadcast never went out.
pub async fn commit<S, B>(events: Vec<Event>, store: &S, bus: &B) -> Result<(), Error>
where
    S: EventStore + ?Sized,
    B: EventBus + ?Sized,
{
    store.save(events.clone()).await?;
    for event in events {
        bus.publish(event).await?;
    }
    Ok(())
}
