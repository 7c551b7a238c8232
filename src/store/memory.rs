//! In-memory event store backend.
//!
//! Backs deterministic tests and embedded use. The whole log sits behind one
//! `RwLock`; a save batch checks uniqueness and appends under a single write
//! lock, which gives the same atomicity and conflict behavior the durable
//! backend gets from its unique index.

use std::sync::RwLock;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::iter;

use crate::error::Error;
use crate::event::{Event, StoreQuery};
use crate::store::{EventStore, EventStream, validate_batch};

/// An in-memory [`EventStore`].
///
/// # Examples
///
/// ```rust
/// use everlog::{Event, EventStore, InMemoryStore, StoreQuery};
/// use futures::TryStreamExt;
/// use uuid::Uuid;
///
/// # async fn example() -> Result<(), everlog::Error> {
/// let store = InMemoryStore::new();
/// let id = Uuid::new_v4();
///
/// store
///     .save(vec![
///         Event::new("UserCreated", "User", id, 0),
///         Event::new("UserRenamed", "User", id, 1),
///     ])
///     .await?;
///
/// let events: Vec<_> = store
///     .load(StoreQuery::builder().aggregate_id(id).build())
///     .await?
///     .try_collect()
///     .await?;
/// assert_eq!(events.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    events: RwLock<Vec<Event>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored.
    pub fn len(&self) -> usize {
        self.events.read().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every stored event. Events are otherwise never deleted; this
    /// exists for tests that reuse a store across cases.
    pub fn clear(&self) {
        self.events.write().expect("event log lock poisoned").clear();
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn save(&self, events: Vec<Event>) -> Result<(), Error> {
        validate_batch(&events)?;

        let mut log = self.events.write().expect("event log lock poisoned");

        // Uniqueness check and append happen under one write lock, so the
        // batch commits atomically or not at all.
        for event in &events {
            let exists = log.iter().any(|stored| {
                stored.aggregate_type() == event.aggregate_type()
                    && stored.aggregate_id() == event.aggregate_id()
                    && stored.aggregate_version() == event.aggregate_version()
            });
            if exists {
                return Err(Error::AggregateVersionAlreadyExists {
                    aggregate_type: event.aggregate_type().to_string(),
                    aggregate_id: event.aggregate_id(),
                    aggregate_version: event.aggregate_version(),
                });
            }
        }

        log.extend(events);
        Ok(())
    }

    async fn load(&self, query: StoreQuery) -> Result<EventStream, Error> {
        let mut matching: Vec<Event> = {
            let log = self.events.read().expect("event log lock poisoned");
            log.iter().filter(|e| query.matches(e)).cloned().collect()
        };
        matching.sort_by_key(|e| (e.timestamp(), e.aggregate_version()));

        Ok(iter(matching.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use futures::TryStreamExt;
    use uuid::Uuid;

    async fn collect(store: &InMemoryStore, query: StoreQuery) -> Vec<Event> {
        store
            .load(query)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn saves_contiguous_batch_and_grows_by_batch_size() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();

        let batch: Vec<_> = (0..4)
            .map(|v| Event::new("UserUpdated", "User", id, v))
            .collect();
        store.save(batch).await.unwrap();
        assert_eq!(store.len(), 4);

        let next: Vec<_> = (4..6)
            .map(|v| Event::new("UserUpdated", "User", id, v))
            .collect();
        store.save(next).await.unwrap();
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn conflicting_version_fails_and_writes_nothing() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();

        store
            .save(vec![Event::new("UserCreated", "User", id, 0)])
            .await
            .unwrap();

        // The batch straddles an existing version; nothing may be written.
        let result = store
            .save(vec![
                Event::new("UserCreated", "User", id, 0),
                Event::new("UserRenamed", "User", id, 1),
            ])
            .await;

        assert!(matches!(
            result,
            Err(Error::AggregateVersionAlreadyExists {
                aggregate_version: 0,
                ..
            })
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn same_version_on_other_aggregates_is_not_a_conflict() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();

        store
            .save(vec![Event::new("UserCreated", "User", id, 0)])
            .await
            .unwrap();
        store
            .save(vec![Event::new("UserCreated", "User", Uuid::new_v4(), 0)])
            .await
            .unwrap();
        store
            .save(vec![Event::new(
                "UserRoleBindingCreated",
                "UserRoleBinding",
                id,
                0,
            )])
            .await
            .unwrap();

        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn gap_in_batch_is_rejected_before_any_write() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();

        let result = store
            .save(vec![
                Event::new("UserCreated", "User", id, 0),
                Event::new("UserRenamed", "User", id, 2),
            ])
            .await;

        assert!(matches!(
            result,
            Err(Error::IncorrectAggregateVersion { .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn load_orders_by_timestamp_then_version() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        let base = Utc::now();

        // Insert out of order; same timestamp for versions 1 and 2 so the
        // version tiebreak is exercised.
        store
            .save(vec![
                Event::new("UserCreated", "User", id, 0).with_timestamp(base),
                Event::new("UserRenamed", "User", id, 1)
                    .with_timestamp(base + TimeDelta::seconds(5)),
                Event::new("UserRenamed", "User", id, 2)
                    .with_timestamp(base + TimeDelta::seconds(5)),
            ])
            .await
            .unwrap();

        let other = Uuid::new_v4();
        store
            .save(vec![
                Event::new("TenantCreated", "Tenant", other, 0)
                    .with_timestamp(base + TimeDelta::seconds(2)),
            ])
            .await
            .unwrap();

        let events = collect(&store, StoreQuery::all()).await;
        let versions: Vec<_> = events
            .iter()
            .map(|e| (e.aggregate_type().to_string(), e.aggregate_version()))
            .collect();
        assert_eq!(
            versions,
            vec![
                ("User".to_string(), 0),
                ("Tenant".to_string(), 0),
                ("User".to_string(), 1),
                ("User".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn load_honors_version_range() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();

        let batch: Vec<_> = (0..6)
            .map(|v| Event::new("UserUpdated", "User", id, v))
            .collect();
        store.save(batch).await.unwrap();

        let query = StoreQuery::builder()
            .aggregate_id(id)
            .min_version(2)
            .max_version(4)
            .build();
        let events = collect(&store, query).await;

        assert_eq!(events.len(), 3);
        assert!(
            events
                .iter()
                .all(|e| (2..=4).contains(&e.aggregate_version()))
        );
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let store = InMemoryStore::new();
        store
            .save(vec![Event::new("UserCreated", "User", Uuid::new_v4(), 0)])
            .await
            .unwrap();
        store.clear();
        assert!(store.is_empty());
    }
}
