//! Proactive anti-entropy middleware.
//!
//! The bus can silently drop messages during outages, so waiting for a gap
//! signal is not enough. For every aggregate type it has seen, this
//! middleware tracks the last successfully applied version and runs a
//! fixed-interval ticker that re-queries the store from `last + 1`, feeding
//! anything found through the wrapped handler. The ticker is restarted on
//! every successful inbound handle, so it only fires when the bus has gone
//! quiet.
//!
//! One `tokio::sync::Mutex` per middleware instance serializes ticks and
//! inbound events; they never run concurrently against the same version
//! state. Ticker tasks are aborted on restart and when the middleware is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::Error;
use crate::event::{Event, StoreQuery};
use crate::handler::EventHandler;
use crate::store::EventStore;

type VersionMap = HashMap<String, u64>;

/// Middleware that periodically re-queries the store to catch events the
/// bus failed to deliver.
pub struct RefreshMiddleware {
    store: Arc<dyn EventStore>,
    interval: Duration,
    next: Arc<dyn EventHandler>,
    versions: Arc<AsyncMutex<VersionMap>>,
    tickers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RefreshMiddleware {
    pub fn new(
        store: Arc<dyn EventStore>,
        interval: Duration,
        next: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            store,
            interval,
            next,
            versions: Arc::new(AsyncMutex::new(HashMap::new())),
            tickers: Mutex::new(HashMap::new()),
        }
    }

    /// The last successfully applied version tracked for an aggregate type.
    pub async fn last_version(&self, aggregate_type: &str) -> Option<u64> {
        self.versions.lock().await.get(aggregate_type).copied()
    }

    fn restart_ticker(&self, aggregate_type: &str) {
        let store = Arc::clone(&self.store);
        let next = Arc::clone(&self.next);
        let versions = Arc::clone(&self.versions);
        let interval = self.interval;
        let owner = aggregate_type.to_string();

        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick fires immediately; the poll belongs
            // one full interval after the event that armed it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) =
                    refresh_aggregate_type(&store, &next, &versions, &owner).await
                {
                    warn!(aggregate_type = %owner, %error, "refresh tick failed");
                }
            }
        });

        let mut tickers = self.tickers.lock().expect("ticker lock poisoned");
        if let Some(previous) = tickers.insert(aggregate_type.to_string(), ticker) {
            previous.abort();
        }
    }
}

impl Drop for RefreshMiddleware {
    fn drop(&mut self) {
        let tickers = self.tickers.lock().expect("ticker lock poisoned");
        for ticker in tickers.values() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl EventHandler for RefreshMiddleware {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        let aggregate_type = event.aggregate_type().to_string();
        let version = event.aggregate_version();

        {
            // Held across the inner handle: inbound events and refresh
            // ticks are serialized against the same version state.
            let mut versions = self.versions.lock().await;
            self.next.handle(event).await?;
            advance(&mut versions, &aggregate_type, version);
        }

        self.restart_ticker(&aggregate_type);
        Ok(())
    }
}

/// One anti-entropy pass: feed every stored event of this aggregate type
/// newer than the tracked version through the wrapped handler, advancing the
/// tracked version as it goes.
async fn refresh_aggregate_type(
    store: &Arc<dyn EventStore>,
    next: &Arc<dyn EventHandler>,
    versions: &Arc<AsyncMutex<VersionMap>>,
    aggregate_type: &str,
) -> Result<(), Error> {
    let mut versions = versions.lock().await;

    let min_version = versions.get(aggregate_type).map_or(0, |v| v + 1);
    let query = StoreQuery::builder()
        .aggregate_type(aggregate_type)
        .min_version(min_version)
        .build();

    let mut events = store.load(query).await?;
    let mut caught_up = 0usize;
    while let Some(event) = events.try_next().await? {
        let version = event.aggregate_version();
        next.handle(event).await?;
        advance(&mut versions, aggregate_type, version);
        caught_up += 1;
    }

    if caught_up > 0 {
        debug!(aggregate_type, caught_up, "refresh pass applied missed events");
    }
    Ok(())
}

fn advance(versions: &mut VersionMap, aggregate_type: &str, version: u64) {
    versions
        .entry(aggregate_type.to_string())
        .and_modify(|v| *v = (*v).max(version))
        .or_insert(version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProjectionHandler;
    use crate::handler::projection::tests::{UserProjection, UserProjector};
    use crate::handler::{InMemoryProjectionRepository, ProjectionRepository, ReplayMiddleware};
    use crate::store::InMemoryStore;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        repository: Arc<InMemoryProjectionRepository<UserProjection>>,
        refresh: RefreshMiddleware,
    }

    /// refresh -> replay -> apply, the standard projection consumer chain.
    fn fixture(interval: Duration) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let repository = Arc::new(InMemoryProjectionRepository::new());
        let apply = Arc::new(ProjectionHandler::new(
            Arc::new(UserProjector),
            repository.clone(),
        ));
        let replay = Arc::new(ReplayMiddleware::new(store.clone(), apply));
        let refresh = RefreshMiddleware::new(store.clone(), interval, replay);
        Fixture {
            store,
            repository,
            refresh,
        }
    }

    fn event(id: Uuid, version: u64) -> Event {
        Event::new(format!("UserUpdated{version}"), "User", id, version)
    }

    #[tokio::test]
    async fn tracks_last_applied_version_per_aggregate_type() {
        let f = fixture(Duration::from_secs(60));
        let id = Uuid::new_v4();
        f.store.save(vec![event(id, 0), event(id, 1)]).await.unwrap();

        f.refresh.handle(event(id, 0)).await.unwrap();
        f.refresh.handle(event(id, 1)).await.unwrap();

        assert_eq!(f.refresh.last_version("User").await, Some(1));
        assert_eq!(f.refresh.last_version("Tenant").await, None);
    }

    #[tokio::test]
    async fn stale_redelivery_does_not_regress_tracked_version() {
        let f = fixture(Duration::from_secs(60));
        let id = Uuid::new_v4();
        f.store.save(vec![event(id, 0), event(id, 1)]).await.unwrap();

        f.refresh.handle(event(id, 0)).await.unwrap();
        f.refresh.handle(event(id, 1)).await.unwrap();
        f.refresh.handle(event(id, 0)).await.unwrap();

        assert_eq!(f.refresh.last_version("User").await, Some(1));
    }

    #[tokio::test]
    async fn failed_handle_leaves_state_and_ticker_untouched() {
        let f = fixture(Duration::from_secs(60));
        let id = Uuid::new_v4();

        // Nothing in the store, so the gap at version 2 cannot be repaired.
        let result = f.refresh.handle(event(id, 2)).await;
        assert!(result.is_err());
        assert_eq!(f.refresh.last_version("User").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_catches_up_events_the_bus_never_delivered() {
        let f = fixture(Duration::from_secs(5));
        let id = Uuid::new_v4();

        f.store.save(vec![event(id, 0)]).await.unwrap();
        f.refresh.handle(event(id, 0)).await.unwrap();

        // Versions 1..=3 reach the store but are never published.
        f.store
            .save(vec![event(id, 1), event(id, 2), event(id, 3)])
            .await
            .unwrap();

        // Let the ticker fire.
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(f.refresh.last_version("User").await, Some(3));
        let projection = f.repository.by_id(id).await.unwrap().unwrap();
        assert_eq!(projection.version, 3);
        assert_eq!(projection.applied.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_a_no_op_when_nothing_is_missing() {
        let f = fixture(Duration::from_secs(5));
        let id = Uuid::new_v4();

        f.store.save(vec![event(id, 0)]).await.unwrap();
        f.refresh.handle(event(id, 0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(f.refresh.last_version("User").await, Some(0));
        let projection = f.repository.by_id(id).await.unwrap().unwrap();
        assert_eq!(projection.applied.len(), 1);
    }
}
