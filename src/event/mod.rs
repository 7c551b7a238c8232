//! The event and query model.
//!
//! This module defines the immutable [`Event`] value describing a domain
//! fact, the [`StoreQuery`] filter over the durable log, and the
//! [`EventMatcher`] predicate used to route bus subscriptions.
//!
//! Events are facts: they are never mutated or deleted once stored. The
//! tuple `(aggregate_type, aggregate_id, aggregate_version)` is globally
//! unique and, combined with `event_type`, fully determines a fact.
//!
//! # Examples
//!
//! ```rust
//! use everlog::Event;
//! use uuid::Uuid;
//!
//! let event = Event::new("UserCreated", "User", Uuid::new_v4(), 0)
//!     .with_data(br#"{"name":"jane"}"#.to_vec())
//!     .with_metadata([("issuer".to_string(), "admin".to_string())]);
//!
//! assert_eq!(event.event_type(), "UserCreated");
//! assert_eq!(event.aggregate_version(), 0);
//! ```

mod registry;

pub use registry::EventRegistry;

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An immutable domain fact.
///
/// `event_type` is a past-tense fact name (e.g. `"UserCreated"`);
/// `aggregate_type` identifies the owning aggregate kind; versions are
/// strictly increasing per `(aggregate_type, aggregate_id)`, starting at 0
/// and incrementing by exactly 1 per event.
///
/// `data` is an opaque, event-type-specific payload; decode it through an
/// [`EventRegistry`]. `metadata` carries cross-cutting context (e.g. issuer
/// identity) that travels with the event but is not part of domain data.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_type: String,
    aggregate_type: String,
    aggregate_id: Uuid,
    aggregate_version: u64,
    timestamp: DateTime<Utc>,
    data: Bytes,
    metadata: HashMap<String, String>,
}

impl Event {
    /// Creates an event with the current time, no payload and no metadata.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        aggregate_version: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            aggregate_version,
            timestamp: Utc::now(),
            data: Bytes::new(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the creation timestamp (not necessarily append time).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the serialized event payload.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the cross-cutting metadata map.
    pub fn with_metadata(
        mut self,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.metadata = metadata.into_iter().collect();
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} for {}/{}",
            self.event_type, self.aggregate_version, self.aggregate_type, self.aggregate_id
        )
    }
}

/// A filter over the durable log. All fields are optional and AND-combined.
///
/// Results are ordered by timestamp ascending, with aggregate version
/// ascending as a tiebreak. Version and timestamp bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    aggregate_id: Option<Uuid>,
    aggregate_type: Option<String>,
    min_version: Option<u64>,
    max_version: Option<u64>,
    min_timestamp: Option<DateTime<Utc>>,
    max_timestamp: Option<DateTime<Utc>>,
}

impl StoreQuery {
    /// A query matching every stored event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn builder() -> StoreQueryBuilder {
        StoreQueryBuilder::default()
    }

    pub fn aggregate_id(&self) -> Option<Uuid> {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type.as_deref()
    }

    pub fn min_version(&self) -> Option<u64> {
        self.min_version
    }

    pub fn max_version(&self) -> Option<u64> {
        self.max_version
    }

    pub fn min_timestamp(&self) -> Option<DateTime<Utc>> {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.max_timestamp
    }

    /// True when the event satisfies every present filter term.
    pub fn matches(&self, event: &Event) -> bool {
        if self.aggregate_id.is_some_and(|id| event.aggregate_id() != id) {
            return false;
        }
        if self
            .aggregate_type
            .as_deref()
            .is_some_and(|t| event.aggregate_type() != t)
        {
            return false;
        }
        if self
            .min_version
            .is_some_and(|min| event.aggregate_version() < min)
        {
            return false;
        }
        if self
            .max_version
            .is_some_and(|max| event.aggregate_version() > max)
        {
            return false;
        }
        if self.min_timestamp.is_some_and(|min| event.timestamp() < min) {
            return false;
        }
        if self.max_timestamp.is_some_and(|max| event.timestamp() > max) {
            return false;
        }
        true
    }
}

/// Builder for [`StoreQuery`].
#[derive(Debug, Clone, Default)]
pub struct StoreQueryBuilder {
    query: StoreQuery,
}

impl StoreQueryBuilder {
    pub fn aggregate_id(mut self, aggregate_id: Uuid) -> Self {
        self.query.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.query.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn min_version(mut self, min_version: u64) -> Self {
        self.query.min_version = Some(min_version);
        self
    }

    pub fn max_version(mut self, max_version: u64) -> Self {
        self.query.max_version = Some(max_version);
        self
    }

    pub fn min_timestamp(mut self, min_timestamp: DateTime<Utc>) -> Self {
        self.query.min_timestamp = Some(min_timestamp);
        self
    }

    pub fn max_timestamp(mut self, max_timestamp: DateTime<Utc>) -> Self {
        self.query.max_timestamp = Some(max_timestamp);
        self
    }

    pub fn build(self) -> StoreQuery {
        self.query
    }
}

/// A predicate over events, used to route bus subscriptions and to scope
/// refresh-middleware polling.
///
/// Terms left unset match any value; on the wire an unset term renders as
/// the `*` wildcard segment of the routing key
/// `"<prefix>.<aggregateType>.<eventType>"`.
///
/// # Examples
///
/// ```rust
/// use everlog::{Event, EventMatcher};
/// use uuid::Uuid;
///
/// let matcher = EventMatcher::any().match_aggregate_type("User");
/// assert_eq!(matcher.routing_key("events"), "events.User.*");
///
/// let event = Event::new("UserCreated", "User", Uuid::new_v4(), 0);
/// assert!(matcher.matches(&event));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMatcher {
    aggregate_type: Option<String>,
    event_type: Option<String>,
}

impl EventMatcher {
    /// A matcher accepting every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts the matcher to one aggregate type.
    pub fn match_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Restricts the matcher to one event type.
    pub fn match_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type.as_deref()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// True when the event satisfies every present term.
    pub fn matches(&self, event: &Event) -> bool {
        if self
            .aggregate_type
            .as_deref()
            .is_some_and(|t| event.aggregate_type() != t)
        {
            return false;
        }
        if self
            .event_type
            .as_deref()
            .is_some_and(|t| event.event_type() != t)
        {
            return false;
        }
        true
    }

    /// Renders the subscription routing key, with `*` for unset terms.
    pub fn routing_key(&self, prefix: &str) -> String {
        format!(
            "{}.{}.{}",
            prefix,
            self.aggregate_type.as_deref().unwrap_or("*"),
            self.event_type.as_deref().unwrap_or("*"),
        )
    }
}

/// Renders the concrete routing key an event is published under.
pub fn topic(prefix: &str, event: &Event) -> String {
    format!(
        "{}.{}.{}",
        prefix,
        event.aggregate_type(),
        event.event_type()
    )
}
