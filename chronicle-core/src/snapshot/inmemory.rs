//! In-memory snapshot store implementation.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore};
use crate::store::StreamKey;

/// When a snapshot store accepts an offer.
///
/// - [`SnapshotPolicy::Always`]: snapshot after every save (high storage
///   cost, minimal replay)
/// - [`SnapshotPolicy::EveryNEvents`]: snapshot once N events have been
///   saved since the last snapshot
/// - [`SnapshotPolicy::Never`]: don't persist snapshots (load-only mode)
///
/// Start with `EveryNEvents(50)` to `EveryNEvents(100)` and tune from
/// there. `Never` fits read replicas that load snapshots created elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Create a snapshot after every save.
    #[default]
    Always,
    /// Create a snapshot every N events.
    EveryNEvents(u64),
    /// Never create snapshots (load-only mode).
    Never,
}

impl SnapshotPolicy {
    /// Check if a snapshot should be created based on events since last
    /// snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => events_since >= *threshold,
            Self::Never => false,
        }
    }
}

/// Error type for in-memory snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The offered state did not encode as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    /// The stored state did not decode as the requested type.
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

type SharedSnapshots = Arc<RwLock<HashMap<StreamKey, Snapshot<serde_json::Value>>>>;

/// In-memory snapshot store with configurable policy.
///
/// States are kept as JSON values, so every load decodes a fresh copy. A
/// snapshot never replaces one taken at the same or a later version.
///
/// ```ignore
/// use chronicle::{Repository, snapshot, store};
///
/// let repo = Repository::new(store::inmemory::Store::new())
///     .with_snapshots(snapshot::inmemory::Store::every(100));
/// ```
#[derive(Clone, Debug)]
pub struct Store {
    snapshots: SharedSnapshots,
    policy: SnapshotPolicy,
}

impl Store {
    /// Create a snapshot store with `policy`.
    #[must_use]
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    /// Create a snapshot store that saves after every save.
    #[must_use]
    pub fn always() -> Self {
        Self::with_policy(SnapshotPolicy::Always)
    }

    /// Create a snapshot store that saves every `n` events.
    #[must_use]
    pub fn every(n: u64) -> Self {
        Self::with_policy(SnapshotPolicy::EveryNEvents(n))
    }

    /// Create a snapshot store that never saves (load-only).
    #[must_use]
    pub fn never() -> Self {
        Self::with_policy(SnapshotPolicy::Never)
    }

    /// The policy deciding which offers are stored.
    #[must_use]
    pub const fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Version of the stored snapshot of a stream, if any.
    #[must_use]
    pub fn snapshot_version(&self, aggregate_kind: &str, aggregate_id: &str) -> Option<u64> {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&StreamKey::new(aggregate_kind, aggregate_id))
            .map(|snapshot| snapshot.version)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::always()
    }
}

impl SnapshotStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn load<T>(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        let stored = {
            let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
            snapshots
                .get(&StreamKey::new(aggregate_kind, aggregate_id))
                .cloned()
        };
        let snapshot = match stored {
            Some(snapshot) => Some(Snapshot {
                version: snapshot.version,
                state: serde_json::from_value(snapshot.state).map_err(Error::Deserialization)?,
            }),
            None => None,
        };
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, create_snapshot))]
    async fn offer_snapshot<CE, T, Create>(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        version: u64,
        create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        let key = StreamKey::new(aggregate_kind, aggregate_id);
        let last_version = self
            .snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&key)
            .map_or(0, |snapshot| snapshot.version);
        let events_since_last_snapshot = version.saturating_sub(last_version);
        if !self.policy.should_snapshot(events_since_last_snapshot) {
            tracing::trace!(events_since_last_snapshot, "snapshot declined by policy");
            return Ok(SnapshotOffer::Declined);
        }

        let snapshot = create_snapshot().map_err(OfferSnapshotError::Create)?;
        let stored = Snapshot {
            version: snapshot.version,
            state: serde_json::to_value(&snapshot.state)
                .map_err(|e| OfferSnapshotError::Snapshot(Error::Serialization(e)))?,
        };

        let offer = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            match snapshots.get(&key) {
                Some(existing) if existing.version >= stored.version => SnapshotOffer::Declined,
                _ => {
                    snapshots.insert(key, stored);
                    SnapshotOffer::Stored
                }
            }
        };

        tracing::debug!(
            events_since_last_snapshot,
            ?offer,
            "snapshot offer evaluated"
        );
        Ok(offer)
    }
}
