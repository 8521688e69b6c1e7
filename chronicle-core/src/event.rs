//! Domain events.
//!
//! Events are stored by name with an opaque JSON payload
//! ([`RecordedEvent`]). `DomainEvent` is the lightweight trait a concrete event
//! struct implements to be recorded and handled with its own type instead of
//! raw JSON.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker trait for typed events.
///
/// Each event carries a unique [`Self::KIND`] identifier, which is the event
/// name it is recorded and dispatched under.
///
/// ```
/// use chronicle_core::event::DomainEvent;
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct NumbersAdded {
///     a: i64,
///     b: i64,
/// }
///
/// impl DomainEvent for NumbersAdded {
///     const KIND: &'static str = "NumbersAdded";
/// }
/// ```
pub trait DomainEvent {
    /// Event name stored alongside the payload.
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`]; never implement it by hand.
pub trait EventKind {
    /// The [`DomainEvent::KIND`] of this event.
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// An event recorded against one aggregate instance.
///
/// `version` is the aggregate version this event produces: the first event of
/// an aggregate has version 1 and every later one increments it by exactly 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Event name, used to find its handler.
    pub name: String,
    /// Event data.
    pub payload: Value,
    /// Wall-clock time the event was recorded.
    pub occurred_at: SystemTime,
    /// Aggregate version this event produces.
    pub version: u64,
}

impl RecordedEvent {
    /// Record `name` at `version`, timestamped now.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value, version: u64) -> Self {
        Self {
            name: name.into(),
            payload,
            occurred_at: SystemTime::now(),
            version,
        }
    }
}

impl AsRef<Self> for RecordedEvent {
    fn as_ref(&self) -> &Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Opened;

    impl DomainEvent for Opened {
        const KIND: &'static str = "Opened";
    }

    #[test]
    fn kind_matches_constant() {
        assert_eq!(Opened.kind(), Opened::KIND);
    }

    #[test]
    fn recorded_event_serializes_with_named_fields() {
        let event = RecordedEvent::new("Opened", json!({ "by": "ada" }), 3);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["name"], "Opened");
        assert_eq!(value["payload"]["by"], "ada");
        assert_eq!(value["version"], 3);

        let back: RecordedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
