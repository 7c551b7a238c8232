//! Reactive gap-fill middleware.
//!
//! When the wrapped handler reports a version hole
//! ([`Error::ProjectionOutdated`]), this middleware synchronously queries
//! the store for exactly the missing range, feeds it through the wrapped
//! handler in order, then re-delivers the original event. The repair blocks
//! the triggering delivery; if the store query fails or the backfill still
//! leaves a gap (the store itself is behind, or another gap appeared
//! concurrently), the error propagates to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::debug;

use crate::error::Error;
use crate::event::{Event, StoreQuery};
use crate::handler::EventHandler;
use crate::store::EventStore;

/// Middleware that closes projection gaps from the store on demand.
pub struct ReplayMiddleware {
    store: Arc<dyn EventStore>,
    next: Arc<dyn EventHandler>,
}

impl ReplayMiddleware {
    pub fn new(store: Arc<dyn EventStore>, next: Arc<dyn EventHandler>) -> Self {
        Self { store, next }
    }

    async fn fill_gap(&self, event: &Event, current: Option<u64>) -> Result<(), Error> {
        let min_version = current.map_or(0, |v| v + 1);
        debug!(
            %event,
            min_version,
            max_version = event.aggregate_version(),
            "replaying missing event range from store"
        );

        let query = StoreQuery::builder()
            .aggregate_type(event.aggregate_type())
            .aggregate_id(event.aggregate_id())
            .min_version(min_version)
            .max_version(event.aggregate_version())
            .build();

        let mut missing = self.store.load(query).await?;
        while let Some(stored) = missing.try_next().await? {
            self.next.handle(stored).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ReplayMiddleware {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        match self.next.handle(event.clone()).await {
            Err(Error::ProjectionOutdated { current, .. }) => {
                self.fill_gap(&event, current).await?;
                // The gap is closed; the original delivery must now land
                // (or be ignored as already applied by the backfill).
                self.next.handle(event).await
            }
            result => result,
        }
    }
}
