//! The projection apply state machine.
//!
//! Projections are derived, rebuildable read models keyed by aggregate id,
//! each carrying the version of the last event applied. The handler here is
//! the single synchronization point that makes the at-least-once, unordered
//! bus safe to consume: it never advances on a non-contiguous version and
//! never reprocesses an already-applied version.
//!
//! Transition rules for an incoming event `e` against projection `p`:
//!
//! 1. no projection yet — expect version 0;
//! 2. `e.version <= p.version` — stale or duplicate delivery, ignored;
//! 3. `e.version > p.version + 1` — a gap, signalled as
//!    [`Error::ProjectionOutdated`] for the replay middleware to repair;
//! 4. otherwise project, verify the new projection carries `e.version`
//!    (anything else is [`Error::ProjectionVersionMismatch`], a projector
//!    bug), and upsert — or remove when the projector returns `None`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::event::Event;
use crate::handler::EventHandler;

/// A derived read model for one aggregate.
///
/// `version` mirrors the aggregate version of the last event successfully
/// applied; the projection only ever reflects a contiguous prefix of its
/// aggregate's event history.
pub trait Projection: Send + Sync {
    fn id(&self) -> Uuid;
    fn version(&self) -> u64;
}

/// Computes the next projection state from an event.
///
/// The previous projection is `None` on the aggregate's first event.
/// Returning `None` deletes the projection (logical deletion). Projections
/// are replaced wholesale on each apply, not incrementally patched.
#[async_trait]
pub trait Projector<P: Projection>: Send + Sync {
    async fn project(&self, event: Event, previous: Option<P>) -> Result<Option<P>, Error>;
}

/// Storage for projections of one type.
#[async_trait]
pub trait ProjectionRepository<P: Projection>: Send + Sync {
    /// Looks up a projection; `None` means no event has been applied yet.
    async fn by_id(&self, id: Uuid) -> Result<Option<P>, Error>;

    /// Inserts or replaces a projection.
    async fn upsert(&self, projection: P) -> Result<(), Error>;

    /// Removes a projection. Removing an absent projection is a no-op.
    async fn remove(&self, id: Uuid) -> Result<(), Error>;
}

/// An in-memory [`ProjectionRepository`].
#[derive(Debug)]
pub struct InMemoryProjectionRepository<P> {
    projections: RwLock<HashMap<Uuid, P>>,
}

impl<P> InMemoryProjectionRepository<P> {
    pub fn new() -> Self {
        Self {
            projections: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.projections
            .read()
            .expect("projection lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for InMemoryProjectionRepository<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: Projection + Clone + 'static> ProjectionRepository<P> for InMemoryProjectionRepository<P> {
    async fn by_id(&self, id: Uuid) -> Result<Option<P>, Error> {
        Ok(self
            .projections
            .read()
            .expect("projection lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn upsert(&self, projection: P) -> Result<(), Error> {
        self.projections
            .write()
            .expect("projection lock poisoned")
            .insert(projection.id(), projection);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), Error> {
        self.projections
            .write()
            .expect("projection lock poisoned")
            .remove(&id);
        Ok(())
    }
}

/// Terminal handler applying events to projections, version-gated.
pub struct ProjectionHandler<P: Projection> {
    projector: Arc<dyn Projector<P>>,
    repository: Arc<dyn ProjectionRepository<P>>,
}

impl<P: Projection> ProjectionHandler<P> {
    pub fn new(
        projector: Arc<dyn Projector<P>>,
        repository: Arc<dyn ProjectionRepository<P>>,
    ) -> Self {
        Self {
            projector,
            repository,
        }
    }
}

#[async_trait]
impl<P: Projection + 'static> EventHandler for ProjectionHandler<P> {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        let aggregate_id = event.aggregate_id();
        let received = event.aggregate_version();

        let previous = self.repository.by_id(aggregate_id).await?;
        let current = previous.as_ref().map(Projection::version);

        if current.is_some_and(|current| received <= current) {
            // Duplicate or stale delivery, not an error.
            debug!(%event, ?current, "ignoring already-applied event");
            return Ok(());
        }

        let expected = current.map_or(0, |v| v + 1);
        if received != expected {
            return Err(Error::ProjectionOutdated {
                aggregate_id,
                current,
                received,
            });
        }

        match self.projector.project(event, previous).await? {
            Some(projection) => {
                if projection.version() != received {
                    return Err(Error::ProjectionVersionMismatch {
                        expected: received,
                        actual: projection.version(),
                    });
                }
                self.repository.upsert(projection).await
            }
            None => self.repository.remove(aggregate_id).await,
        }
    }
}
