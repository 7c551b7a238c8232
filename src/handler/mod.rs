//! Event handlers and the middleware chain.
//!
//! A consumer registered on the bus is a chain of middlewares ending in a
//! terminal handler — typically the projection apply state machine
//! ([`ProjectionHandler`]) or a [`ReactorHandler`]. Chains are composed
//! explicitly: each middleware is constructed with the next handler in the
//! chain, so construction order is visible at the call site and every stage
//! can be tested in isolation.
//!
//! ```rust
//! use everlog::{
//!     InMemoryProjectionRepository, InMemoryStore, ProjectionHandler, RefreshMiddleware,
//!     ReplayMiddleware,
//! };
//! use std::sync::Arc;
//! use tokio::time::Duration;
//! # use everlog::{Error, Event, Projection, Projector};
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
//! #     async fn project(&self, event: Event, previous: Option<User>) -> Result<Option<User>, Error> {
//! #         let _ = previous;
//! #         Ok(Some(User { id: event.aggregate_id(), version: event.aggregate_version() }))
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), everlog::Error> {
//! let store = Arc::new(InMemoryStore::new());
//! let repository = Arc::new(InMemoryProjectionRepository::new());
//!
//! // Innermost first: apply <- replay <- refresh.
//! let apply = Arc::new(ProjectionHandler::new(
//!     Arc::new(UserProjector),
//!     repository,
//! ));
//! let replay = Arc::new(ReplayMiddleware::new(store.clone(), apply));
//! let refresh = Arc::new(RefreshMiddleware::new(
//!     store,
//!     Duration::from_secs(30),
//!     replay,
//! ));
//! # let _ = refresh;
//! # Ok(())
//! # }
//! ```

mod projection;
mod reactor;
mod refresh;
mod replay;

pub use projection::{
    InMemoryProjectionRepository, Projection, ProjectionHandler, ProjectionRepository, Projector,
};
pub use reactor::{Reactor, ReactorHandler};
pub use refresh::RefreshMiddleware;
pub use replay::ReplayMiddleware;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Error;
use crate::event::Event;

/// A stage in a consumer's handler chain.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), Error>;
}

/// Pass-through middleware that traces every event it sees.
///
/// With no `next` handler it acts as a terminal sink, useful as a consumer
/// that only observes the event flow.
pub struct LoggingMiddleware {
    next: Option<Arc<dyn EventHandler>>,
}

impl LoggingMiddleware {
    pub fn new(next: Arc<dyn EventHandler>) -> Self {
        Self { next: Some(next) }
    }

    /// A terminal logging sink.
    pub fn terminal() -> Self {
        Self { next: None }
    }
}

#[async_trait]
impl EventHandler for LoggingMiddleware {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        debug!(%event, "handling event");
        match &self.next {
            Some(next) => next.handle(event).await,
            None => Ok(()),
        }
    }
}
