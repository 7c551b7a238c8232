//! The durable, append-only event log.
//!
//! The store is the system of record and the fallback data source for the
//! asynchronous side: consumers that detect a gap in their projection state
//! query it directly to repair. Two backends implement [`EventStore`]:
//! [`InMemoryStore`](crate::InMemoryStore) for tests and embedded use, and
//! [`PostgresStore`](crate::PostgresStore) for durability.
//!
//! # Contract
//!
//! - `save` takes a non-empty batch of events for a single aggregate with
//!   contiguous versions, and writes it atomically. A version another writer
//!   already committed surfaces as
//!   [`Error::AggregateVersionAlreadyExists`](crate::Error::AggregateVersionAlreadyExists) —
//!   the optimistic-concurrency conflict signal callers use to reload and
//!   retry.
//! - `load` returns a lazy stream of matching events ordered by timestamp
//!   ascending, aggregate version ascending as a tiebreak.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{ConnectionState, PostgresStore};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Error;
use crate::event::{Event, StoreQuery};

/// A lazy cursor over stored events. Consume until exhaustion or drop early.
pub type EventStream = BoxStream<'static, Result<Event, Error>>;

/// The append-only event store.
///
/// Implementations serve concurrent `save`/`load` calls from independent
/// callers; correctness of concurrent writes rests on uniqueness of
/// `(aggregate_type, aggregate_id, aggregate_version)`, not on application
/// locks.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically appends a batch of events for one aggregate.
    ///
    /// The batch must be non-empty, share one aggregate, and carry contiguous
    /// versions starting from the first event's version; violations fail with
    /// a validation error before any write is attempted.
    async fn save(&self, events: Vec<Event>) -> Result<(), Error>;

    /// Streams every event matching the query, ordered by timestamp then
    /// aggregate version.
    async fn load(&self, query: StoreQuery) -> Result<EventStream, Error>;
}

/// Validates a save batch before any I/O: non-empty, single aggregate,
/// contiguous versions from the first event's version.
pub(crate) fn validate_batch(events: &[Event]) -> Result<(), Error> {
    let first = events.first().ok_or(Error::EmptyEventBatch)?;

    for (i, event) in events.iter().enumerate() {
        if event.aggregate_type() != first.aggregate_type()
            || event.aggregate_id() != first.aggregate_id()
        {
            return Err(Error::MixedAggregateBatch {
                expected_type: first.aggregate_type().to_string(),
                expected_id: first.aggregate_id(),
                found_type: event.aggregate_type().to_string(),
                found_id: event.aggregate_id(),
            });
        }

        let expected = first.aggregate_version() + i as u64;
        if event.aggregate_version() != expected {
            return Err(Error::IncorrectAggregateVersion {
                expected,
                actual: event.aggregate_version(),
            });
        }
    }

    Ok(())
}
