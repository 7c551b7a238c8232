//! Topic-routed publish/subscribe distribution of committed events.
//!
//! The bus broadcasts events a writer has already committed to the store.
//! Delivery is at-least-once: consumers must tolerate duplicates and, across
//! aggregates, reordering — reconstructing per-aggregate order from
//! `aggregate_version` is the job of the handler chain
//! (see [`ProjectionHandler`](crate::ProjectionHandler),
//! [`ReplayMiddleware`](crate::ReplayMiddleware) and
//! [`RefreshMiddleware`](crate::RefreshMiddleware)).
//!
//! Events are routed under `"<prefix>.<aggregateType>.<eventType>"`;
//! subscribers bind one or more [`EventMatcher`]s, with unset terms acting
//! as `*` wildcard segments.

mod memory;

pub use memory::InMemoryBus;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::event::{Event, EventMatcher};
use crate::handler::EventHandler;

/// The event distribution contract.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Routes a committed event to every consumer whose matchers accept it.
    async fn publish(&self, event: Event) -> Result<(), Error>;

    /// Registers a named consumer bound to one or more matchers. Each
    /// consumer gets its own delivery worker; a slow handler does not stall
    /// other consumers.
    async fn subscribe(
        &self,
        name: &str,
        matchers: Vec<EventMatcher>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), Error>;

    /// Cooperative shutdown: stop accepting inbound events, let in-flight
    /// handler invocations finish, release workers.
    async fn close(&self);
}
