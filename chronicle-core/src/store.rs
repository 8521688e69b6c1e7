//! Persistence layer abstractions.
//!
//! This module describes the storage contract (`EventStore`), the durable
//! event representation (`StreamEvent`), and a reference in-memory
//! implementation.
use std::future::Future;

pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::event::RecordedEvent;

pub mod inmemory;

/// A recorded event as written to and read from a store.
///
/// Carries the aggregate type and id alongside the event so a store can
/// partition streams however it likes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Aggregate name the stream belongs to.
    pub aggregate_kind: String,
    /// Instance id within the aggregate.
    pub aggregate_id: String,
    /// The event itself.
    #[serde(flatten)]
    pub event: RecordedEvent,
}

impl StreamEvent {
    /// Tag `event` with the stream it belongs to.
    #[must_use]
    pub fn new(
        aggregate_kind: impl Into<String>,
        aggregate_id: impl Into<String>,
        event: RecordedEvent,
    ) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id: aggregate_id.into(),
            event,
        }
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// Stream version this event produces.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.event.version
    }
}

impl AsRef<RecordedEvent> for StreamEvent {
    fn as_ref(&self) -> &RecordedEvent {
        &self.event
    }
}

/// Abstraction over the durable event log.
///
/// Streams are identified by `(aggregate_kind, aggregate_id)`. Versions inside
/// a stream start at 1 and increase by exactly 1.
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Latest durable version of a stream, `0` for a stream with no events.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn aggregate_version<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a str,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

    /// Events of a stream with version strictly greater than `since_version`.
    ///
    /// The result need not be sorted.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_history<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a str,
        since_version: u64,
    ) -> impl Future<Output = Result<Vec<StreamEvent>, Self::Error>> + Send + 'a;

    /// Persist a batch of events atomically.
    ///
    /// Implementations must make this atomic with respect to concurrent
    /// writers of the same stream.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when persistence fails.
    fn save_events(
        &self,
        events: NonEmpty<StreamEvent>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
// ANCHOR_END: event_store_trait

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    aggregate_kind: String,
    aggregate_id: String,
}

impl StreamKey {
    pub(crate) fn new(aggregate_kind: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}
