//! PostgreSQL event store backend.
//!
//! Durability rests on a single `events` table with a unique index on
//! `(aggregate_id, aggregate_type, aggregate_version)`; the database's
//! constraint enforcement, not application locking, decides optimistic
//! concurrency conflicts.
//!
//! Connection handling is a small state machine,
//! `Disconnected -> Connecting -> Connected`, driven by a background task
//! with a fixed retry delay. The schema is (re)provisioned on every
//! reconnect so a freshly restored database comes back usable without
//! operator action.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::Error;
use crate::event::{Event, StoreQuery};
use crate::store::{EventStore, EventStream, validate_batch};

/// Lifecycle state of the store's database connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id                BIGSERIAL PRIMARY KEY,
    event_type        VARCHAR(255) NOT NULL,
    aggregate_id      UUID NOT NULL,
    aggregate_type    VARCHAR(255) NOT NULL,
    aggregate_version BIGINT NOT NULL,
    timestamp         TIMESTAMPTZ NOT NULL,
    metadata          JSONB NOT NULL DEFAULT '{}'::jsonb,
    data              BYTEA NOT NULL,
    UNIQUE (aggregate_id, aggregate_type, aggregate_version)
);

CREATE INDEX IF NOT EXISTS idx_events_aggregate
    ON events (aggregate_type, aggregate_id, aggregate_version);
";

// SQLSTATE codes the save path has to tell apart.
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// A PostgreSQL-backed [`EventStore`].
///
/// The connection pool is shared read/write across all callers. Writes that
/// fail with a storage-level serialization conflict are retried internally
/// with bounded exponential backoff; the domain-level
/// [`Error::AggregateVersionAlreadyExists`] conflict is never retried.
///
/// # Examples
///
/// ```rust,no_run
/// use everlog::{EventStore, PostgresStore, StoreConfig, StoreQuery};
/// use tokio::time::Duration;
///
/// # async fn example() -> Result<(), everlog::Error> {
/// let config = StoreConfig::from_env()?;
/// let store = PostgresStore::new(config);
///
/// // Blocks until connected, or fails after the deadline.
/// store.connect(Duration::from_secs(10)).await?;
///
/// let mut events = store.load(StoreQuery::all()).await?;
/// # Ok(())
/// # }
/// ```
pub struct PostgresStore {
    config: StoreConfig,
    pool: Arc<RwLock<Option<PgPool>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    failure_tx: mpsc::Sender<()>,
    failure_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresStore {
    /// Creates a disconnected store. Call [`connect`](Self::connect) before
    /// saving or loading.
    pub fn new(config: StoreConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (failure_tx, failure_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            pool: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            failure_tx,
            failure_rx: Mutex::new(Some(failure_rx)),
            shutdown_tx,
            connection_task: Mutex::new(None),
        }
    }

    /// Current state of the connection lifecycle.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Blocks until the store reaches `Connected`, or fails with
    /// [`Error::CouldNotConnect`] once `timeout` elapses.
    ///
    /// The first call starts the background connection loop; the loop keeps
    /// reconnecting with a fixed delay for the lifetime of the store, so a
    /// later connection loss heals without another `connect` call.
    pub async fn connect(&self, timeout: Duration) -> Result<(), Error> {
        self.spawn_connection_loop();

        let mut state_rx = self.state_rx.clone();
        let wait = async move {
            loop {
                if *state_rx.borrow_and_update() == ConnectionState::Connected {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    // Connection loop is gone; the store was closed.
                    return Err(Error::CouldNotConnect);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::CouldNotConnect),
        }
    }

    /// Stops the connection loop and drops the pool. Cooperative: in-flight
    /// save/load calls finish against the pool they already cloned.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.connection_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.pool.write().expect("pool lock poisoned").take();
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }

    fn spawn_connection_loop(&self) {
        let mut task_slot = self.connection_task.lock().expect("task lock poisoned");
        if task_slot.is_some() {
            return;
        }
        let Some(failure_rx) = self
            .failure_rx
            .lock()
            .expect("failure lock poisoned")
            .take()
        else {
            return;
        };

        let config = self.config.clone();
        let pool_slot = Arc::clone(&self.pool);
        let state_tx = Arc::clone(&self.state_tx);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task_slot = Some(tokio::spawn(connection_loop(
            config,
            pool_slot,
            state_tx,
            failure_rx,
            shutdown_rx,
        )));
    }

    fn current_pool(&self) -> Result<PgPool, Error> {
        self.pool
            .read()
            .expect("pool lock poisoned")
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Flags the connection loop when an operation failed for connectivity
    /// reasons, so it re-enters the reconnect cycle.
    fn report_failure(&self, error: &sqlx::Error) {
        if is_connectivity_error(error) {
            let _ = self.failure_tx.try_send(());
        }
    }

    async fn insert_batch(&self, pool: &PgPool, events: &[Event]) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO events \
                 (event_type, aggregate_id, aggregate_type, aggregate_version, timestamp, metadata, data) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(event.event_type())
            .bind(event.aggregate_id())
            .bind(event.aggregate_type())
            .bind(event.aggregate_version() as i64)
            .bind(event.timestamp())
            .bind(sqlx::types::Json(event.metadata()))
            .bind(&event.data()[..])
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn save(&self, events: Vec<Event>) -> Result<(), Error> {
        validate_batch(&events)?;
        let pool = self.current_pool()?;

        let max_attempts = self.config.max_save_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.insert_batch(&pool, &events).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            match error_code(&error).as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    // A real conflict: someone else committed this version.
                    // Resolving it needs a freshly loaded aggregate, so it is
                    // the caller's to retry, not ours.
                    let first = &events[0];
                    return Err(Error::AggregateVersionAlreadyExists {
                        aggregate_type: first.aggregate_type().to_string(),
                        aggregate_id: first.aggregate_id(),
                        aggregate_version: first.aggregate_version(),
                    });
                }
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    if attempt >= max_attempts {
                        return Err(Error::CouldNotSave {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }
                    let delay = self.config.retry_delay().calculate_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient serialization conflict, retrying save"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    self.report_failure(&error);
                    return Err(error.into());
                }
            }
        }
    }

    async fn load(&self, query: StoreQuery) -> Result<EventStream, Error> {
        let pool = self.current_pool()?;
        let failure_tx = self.failure_tx.clone();

        // Rows are forwarded through a channel so the public stream type owns
        // no borrow of the query or the pool.
        let (tx, rx) = mpsc::channel::<Result<Event, Error>>(64);
        tokio::spawn(async move {
            let mut builder = build_load_query(&query);
            let mut rows = builder.build().fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = match row {
                    Ok(row) => row_to_event(&row),
                    Err(error) => {
                        if is_connectivity_error(&error) {
                            let _ = failure_tx.try_send(());
                        }
                        Err(error.into())
                    }
                };
                let stop = item.is_err();
                if tx.send(item).await.is_err() || stop {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

async fn connection_loop(
    config: StoreConfig,
    pool_slot: Arc<RwLock<Option<PgPool>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    mut failure_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let _ = state_tx.send(ConnectionState::Connecting);

        let connected = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .connect(config.url())
            .await;

        match connected {
            Ok(pool) => {
                // Schema is re-provisioned on every reconnect.
                if let Err(error) = provision_schema(&pool).await {
                    warn!(%error, "failed to provision event store schema");
                    let _ = state_tx.send(ConnectionState::Disconnected);
                } else {
                    *pool_slot.write().expect("pool lock poisoned") = Some(pool);
                    let _ = state_tx.send(ConnectionState::Connected);
                    debug!("event store connected");

                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = failure_rx.recv() => {
                            warn!("event store connection lost, reconnecting");
                            pool_slot.write().expect("pool lock poisoned").take();
                            let _ = state_tx.send(ConnectionState::Disconnected);
                        }
                    }
                }
            }
            Err(error) => {
                debug!(%error, "event store connection attempt failed");
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
        }

        // Fixed retry delay, deliberately not exponential.
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(config.connect_retry_delay()) => {}
        }
    }
}

async fn provision_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(CREATE_EVENTS_TABLE).execute(pool).await?;
    Ok(())
}

fn build_load_query(query: &StoreQuery) -> sqlx::QueryBuilder<'static, sqlx::Postgres> {
    let mut builder = sqlx::QueryBuilder::new(
        "SELECT event_type, aggregate_id, aggregate_type, aggregate_version, \
         timestamp, metadata, data FROM events",
    );

    let mut separator = " WHERE ";
    if let Some(aggregate_id) = query.aggregate_id() {
        builder.push(separator).push("aggregate_id = ");
        builder.push_bind(aggregate_id);
        separator = " AND ";
    }
    if let Some(aggregate_type) = query.aggregate_type() {
        builder.push(separator).push("aggregate_type = ");
        builder.push_bind(aggregate_type.to_string());
        separator = " AND ";
    }
    if let Some(min_version) = query.min_version() {
        builder.push(separator).push("aggregate_version >= ");
        builder.push_bind(min_version as i64);
        separator = " AND ";
    }
    if let Some(max_version) = query.max_version() {
        builder.push(separator).push("aggregate_version <= ");
        builder.push_bind(max_version as i64);
        separator = " AND ";
    }
    if let Some(min_timestamp) = query.min_timestamp() {
        builder.push(separator).push("timestamp >= ");
        builder.push_bind(min_timestamp);
        separator = " AND ";
    }
    if let Some(max_timestamp) = query.max_timestamp() {
        builder.push(separator).push("timestamp <= ");
        builder.push_bind(max_timestamp);
        let _ = separator;
    }

    builder.push(" ORDER BY timestamp ASC, aggregate_version ASC");
    builder
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, Error> {
    let event_type: String = row.try_get("event_type")?;
    let aggregate_id: uuid::Uuid = row.try_get("aggregate_id")?;
    let aggregate_type: String = row.try_get("aggregate_type")?;
    let aggregate_version: i64 = row.try_get("aggregate_version")?;
    let timestamp: chrono::DateTime<chrono::Utc> = row.try_get("timestamp")?;
    let metadata: sqlx::types::Json<HashMap<String, String>> = row.try_get("metadata")?;
    let data: Vec<u8> = row.try_get("data")?;

    Ok(
        Event::new(event_type, aggregate_type, aggregate_id, aggregate_version as u64)
            .with_timestamp(timestamp)
            .with_data(data)
            .with_metadata(metadata.0),
    )
}

fn error_code(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_connectivity_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Tls(_)
    )
}
