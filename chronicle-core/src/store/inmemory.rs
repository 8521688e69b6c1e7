//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and examples.
//!
//! # Example
//!
//! ```
//! use chronicle_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert_eq!(store.stream_count(), 0);
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::store::{EventStore, StreamEvent, StreamKey};

/// In-memory event store that keeps streams in a hash map.
///
/// Clones share the same streams. `save_events` enforces the stream's version
/// sequence the way a unique `(stream, version)` constraint would in a
/// database: a batch whose first version does not directly follow the stream's
/// last one is rejected as a whole.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<HashMap<StreamKey, Vec<StreamEvent>>>>,
}

impl Store {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event of one stream, in version order.
    #[must_use]
    pub fn events(&self, aggregate_kind: &str, aggregate_id: &str) -> Vec<StreamEvent> {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .get(&StreamKey::new(aggregate_kind, aggregate_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of streams holding at least one event.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("streams", &self.stream_count())
            .finish()
    }
}

/// Error type for in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    /// The batch does not start right after the stream's last version.
    #[error(
        "stream {aggregate_kind}/{aggregate_id} is at version {current}, cannot append version {attempted}"
    )]
    VersionConflict {
        /// Aggregate name of the stream.
        aggregate_kind: String,
        /// Instance id of the stream.
        aggregate_id: String,
        /// Last stored version, 0 for an empty stream.
        current: u64,
        /// Version of the first event in the batch.
        attempted: u64,
    },
    /// The batch spans streams or skips versions.
    #[error("events in a batch must belong to one stream and have consecutive versions")]
    MalformedBatch,
}

impl EventStore for Store {
    type Error = InMemoryError;

    #[tracing::instrument(skip(self))]
    fn aggregate_version<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a str,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        let version = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .get(&StreamKey::new(aggregate_kind, aggregate_id))
                .and_then(|stream| stream.last().map(StreamEvent::version))
                .unwrap_or(0)
        };
        tracing::trace!(version, "retrieved stream version");
        std::future::ready(Ok(version))
    }

    #[tracing::instrument(skip(self))]
    fn load_history<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a str,
        since_version: u64,
    ) -> impl Future<Output = Result<Vec<StreamEvent>, Self::Error>> + Send + 'a {
        let events: Vec<StreamEvent> = self
            .events(aggregate_kind, aggregate_id)
            .into_iter()
            .filter(|event| event.version() > since_version)
            .collect();
        tracing::debug!(events_loaded = events.len(), "loaded events from store");
        std::future::ready(Ok(events))
    }

    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    fn save_events(
        &self,
        events: NonEmpty<StreamEvent>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = (|| {
            let first = &events.head;
            let well_formed = events.iter().zip(events.iter().skip(1)).all(|(a, b)| {
                b.aggregate_kind == a.aggregate_kind
                    && b.aggregate_id == a.aggregate_id
                    && b.version() == a.version() + 1
            });
            if !well_formed {
                return Err(InMemoryError::MalformedBatch);
            }

            let key = StreamKey::new(first.aggregate_kind.as_str(), first.aggregate_id.as_str());
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let current = inner
                .get(&key)
                .and_then(|stream| stream.last())
                .map_or(0, StreamEvent::version);
            if first.version() != current + 1 {
                tracing::debug!(
                    current,
                    attempted = first.version(),
                    "version mismatch, rejecting append"
                );
                return Err(InMemoryError::VersionConflict {
                    aggregate_kind: first.aggregate_kind.clone(),
                    aggregate_id: first.aggregate_id.clone(),
                    current,
                    attempted: first.version(),
                });
            }
            inner.entry(key).or_default().extend(events.iter().cloned());
            drop(inner);
            tracing::debug!(events_appended = events.len(), "events committed to stream");
            Ok(())
        })();

        std::future::ready(result)
    }
}
