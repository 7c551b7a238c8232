//! Error types for the everlog event store and projection engine.
//!
//! One crate-wide error enum, grouped by the failure classes callers have to
//! distinguish: batch validation (rejected before any I/O), optimistic
//! concurrency conflicts (the caller reloads and retries the command),
//! connectivity, projection integrity, and bus failures. Transient storage
//! errors are retried internally and only surface here once the retry budget
//! is exhausted.

use thiserror::Error;
use uuid::Uuid;

/// Represents errors that can occur in the everlog event sourcing system.
#[derive(Debug, Error)]
pub enum Error {
    /// A save was attempted with an empty event batch.
    #[error("event batch must not be empty")]
    EmptyEventBatch,

    /// A save batch contained events belonging to more than one aggregate.
    #[error(
        "all events in a batch must belong to aggregate '{expected_type}/{expected_id}', \
         found '{found_type}/{found_id}'"
    )]
    MixedAggregateBatch {
        expected_type: String,
        expected_id: Uuid,
        found_type: String,
        found_id: Uuid,
    },

    /// An aggregate version did not match the expected contiguous sequence.
    #[error("incorrect aggregate version: expected {expected}, got {actual}")]
    IncorrectAggregateVersion { expected: u64, actual: u64 },

    /// The canonical optimistic-concurrency conflict: another writer already
    /// committed this version. Never retried internally; the caller must
    /// reload the aggregate and retry the whole command.
    #[error(
        "aggregate version {aggregate_version} already exists for \
         '{aggregate_type}/{aggregate_id}'"
    )]
    AggregateVersionAlreadyExists {
        aggregate_type: String,
        aggregate_id: Uuid,
        aggregate_version: u64,
    },

    /// Transient storage failures persisted across the whole retry budget.
    #[error("could not save events after {attempts} attempts")]
    CouldNotSave {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The store did not reach the connected state before the caller's
    /// deadline or shutdown signal fired.
    #[error("could not connect to the event store")]
    CouldNotConnect,

    /// An operation was attempted while the store connection is down. The
    /// background reconnect loop runs independently; re-attempt once
    /// reconnected.
    #[error("event store is not connected")]
    NotConnected,

    /// A projection is behind the incoming event: a gap exists between the
    /// version it reflects and the version delivered. `current` is `None`
    /// when no projection exists yet. This is the signal consumed by the
    /// replay middleware, not a terminal failure.
    #[error(
        "projection for aggregate {aggregate_id} is outdated: at version {current:?}, \
         received version {received}"
    )]
    ProjectionOutdated {
        aggregate_id: Uuid,
        current: Option<u64>,
        received: u64,
    },

    /// The projector returned a projection whose version does not match the
    /// event it was given. Indicates a projector bug or data corruption;
    /// fatal for this event.
    #[error("projection version mismatch after apply: expected {expected}, got {actual}")]
    ProjectionVersionMismatch { expected: u64, actual: u64 },

    /// A projection repository lookup or write failed for a reason other
    /// than not-found (not-found is benign and triggers creation).
    #[error("projection repository error: {0}")]
    ProjectionRepository(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An event could not be published to the bus.
    #[error("could not publish event to topic '{topic}'")]
    CouldNotPublish { topic: String },

    /// A consumer subscription could not be registered.
    #[error("could not subscribe consumer '{name}': {reason}")]
    CouldNotSubscribe { name: String, reason: String },

    /// A reactor failed while handling an event.
    #[error("reactor failed to handle event")]
    Reactor(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No decoder has been registered for this event type.
    #[error("no event data registered for event type '{0}'")]
    UnregisteredEventType(String),

    /// Indicates a failure to deserialize event data or metadata.
    #[error(transparent)]
    EventDataDeserialization(#[from] serde_json::Error),

    /// Indicates a general database error from the storage backend.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Indicates an invalid configuration parameter.
    #[error("invalid configuration{}: {message}", parameter.as_ref().map(|p| format!(" parameter '{p}'")).unwrap_or_default())]
    InvalidConfig {
        message: String,
        parameter: Option<String>,
    },
}

impl Error {
    /// True for errors rejected by batch validation before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyEventBatch
                | Error::MixedAggregateBatch { .. }
                | Error::IncorrectAggregateVersion { .. }
        )
    }

    /// True for the optimistic-concurrency conflict the caller must resolve
    /// by reloading the aggregate and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AggregateVersionAlreadyExists { .. })
    }
}
