//! Type registry for event payloads.
//!
//! Event payloads travel as opaque bytes; the registry maps event-type
//! strings to decoders so consumers can reconstruct typed data. It is an
//! explicit object built once at process start and passed by handle, rather
//! than ambient global state.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::Error;

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, Error> + Send + Sync>;

/// Maps event-type strings to payload decoders.
///
/// # Examples
///
/// ```rust
/// use everlog::EventRegistry;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize, PartialEq)]
/// struct UserCreated {
///     name: String,
/// }
///
/// let mut registry = EventRegistry::new();
/// registry.register::<UserCreated>("UserCreated");
///
/// let data = registry
///     .decode_as::<UserCreated>("UserCreated", br#"{"name":"jane"}"#)
///     .unwrap();
/// assert_eq!(data.name, "jane");
/// ```
#[derive(Default)]
pub struct EventRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the payload type for `event_type`. A later
    /// registration for the same type string replaces the earlier one.
    pub fn register<T>(&mut self, event_type: impl Into<String>)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.decoders.insert(
            event_type.into(),
            Box::new(|data| {
                let value: T = serde_json::from_slice(data)?;
                Ok(Box::new(value))
            }),
        );
    }

    /// True when a decoder is registered for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Decodes a payload to its type-erased registered type.
    pub fn decode(
        &self,
        event_type: &str,
        data: &[u8],
    ) -> Result<Box<dyn Any + Send + Sync>, Error> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| Error::UnregisteredEventType(event_type.to_string()))?;
        decode(data)
    }

    /// Decodes a payload and downcasts it to `T`. Fails with
    /// [`Error::UnregisteredEventType`] when `event_type` was registered
    /// with a different payload type.
    pub fn decode_as<T: 'static>(&self, event_type: &str, data: &[u8]) -> Result<Box<T>, Error> {
        self.decode(event_type, data)?
            .downcast::<T>()
            .map_err(|_| Error::UnregisteredEventType(event_type.to_string()))
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
