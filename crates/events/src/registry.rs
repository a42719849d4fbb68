//! Typed payload decoding.
//!
//! Callers model the events they understand as a closed enum and register one
//! decode function per `(aggregate type, event type, revision)` tag. Decoding
//! an event whose tag was never registered is an error, never a silent skip.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::{Event, EventTag};

type DecodeFn<T> = Box<dyn Fn(&JsonValue) -> Result<T, serde_json::Error> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownEventType(EventTag),

    #[error("invalid payload for {tag}: {source}")]
    InvalidPayload {
        tag: EventTag,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode table from event tags to the caller's closed enum `T`.
pub struct EventRegistry<T> {
    decoders: HashMap<EventTag, DecodeFn<T>>,
}

impl<T: 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<T: 'static> core::fmt::Debug for EventRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("tags", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: 'static> EventRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type `P` for `tag`, wrapped into `T` by `wrap`.
    ///
    /// Registering the same tag twice replaces the earlier decoder.
    pub fn register<P, F>(mut self, tag: EventTag, wrap: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> T + Send + Sync + 'static,
    {
        self.decoders.insert(
            tag,
            Box::new(move |payload: &JsonValue| P::deserialize(payload).map(&wrap)),
        );
        self
    }

    /// Register a raw decode function for `tag`.
    pub fn register_with<F>(mut self, tag: EventTag, decode: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<T, serde_json::Error> + Send + Sync + 'static,
    {
        self.decoders.insert(tag, Box::new(decode));
        self
    }

    pub fn contains(&self, tag: &EventTag) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn decode(&self, event: &Event) -> Result<T, DecodeError> {
        let tag = event.tag();
        let decode = self
            .decoders
            .get(&tag)
            .ok_or_else(|| DecodeError::UnknownEventType(tag.clone()))?;
        decode(&event.payload).map_err(|source| DecodeError::InvalidPayload { tag, source })
    }

    /// Decode a slice of events, stopping at the first failure.
    pub fn decode_all(&self, events: &[Event]) -> Result<Vec<T>, DecodeError> {
        events.iter().map(|e| self.decode(e)).collect()
    }
}
