//! Snapshot support for faster aggregate loading.
//!
//! A snapshot captures an aggregate's state at a stream version, so loading
//! only replays the events recorded after it. This module provides:
//!
//! - [`Snapshot`] - state at a version
//! - [`SnapshotStore`] - trait for snapshot persistence with policy
//! - [`NoSnapshots`] - no-op implementation; this is the default when
//!   [`Repository::with_snapshots`](crate::repository::Repository::with_snapshots)
//!   is not called
//! - [`inmemory`] - in-memory reference implementation with configurable policy

use std::convert::Infallible;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub mod inmemory;

/// Aggregate state as of `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// Version of the last event folded into `state`.
    pub version: u64,
    /// The aggregate state.
    pub state: T,
}

/// Trait for snapshot persistence with built-in policy.
///
/// Implementations decide both *how* to store snapshots and *when* to store
/// them. The repository calls [`offer_snapshot`](SnapshotStore::offer_snapshot)
/// after each successful save.
// ANCHOR: snapshot_store_trait
pub trait SnapshotStore: Send + Sync {
    /// Error type for snapshot operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the most recent snapshot of a stream.
    ///
    /// Returns `Ok(None)` if no snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the stored state
    /// does not decode as `T`.
    fn load<T>(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> impl Future<Output = Result<Option<Snapshot<T>>, Self::Error>> + Send
    where
        T: DeserializeOwned;

    /// Whether to store a snapshot at `version`, with lazy creation.
    ///
    /// Implementations may decline without invoking `create_snapshot`.
    /// Returning [`SnapshotOffer::Stored`] indicates that the snapshot was
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns [`OfferSnapshotError::Create`] if `create_snapshot` fails.
    /// Returns [`OfferSnapshotError::Snapshot`] if persistence fails.
    fn offer_snapshot<CE, T, Create>(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        version: u64,
        create_snapshot: Create,
    ) -> impl Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>> + Send
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send;
}
// ANCHOR_END: snapshot_store_trait

/// Result of offering a snapshot to a store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    /// The store's policy skipped this version.
    Declined,
    /// The snapshot was persisted.
    Stored,
}

/// Error returned by [`SnapshotStore::offer_snapshot`].
#[derive(Debug, thiserror::Error)]
pub enum OfferSnapshotError<SnapshotError, CreateError>
where
    SnapshotError: std::error::Error + 'static,
    CreateError: std::error::Error + 'static,
{
    /// The snapshot could not be produced.
    #[error("failed to create snapshot: {0}")]
    Create(#[source] CreateError),
    /// The store failed to persist it.
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] SnapshotError),
}

/// No-op snapshot store: loads nothing, declines every offer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    type Error = Infallible;

    async fn load<T>(
        &self,
        _aggregate_kind: &str,
        _aggregate_id: &str,
    ) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        Ok(None)
    }

    async fn offer_snapshot<CE, T, Create>(
        &self,
        _aggregate_kind: &str,
        _aggregate_id: &str,
        _version: u64,
        _create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        Ok(SnapshotOffer::Declined)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, io};

    use super::*;

    #[tokio::test]
    async fn no_snapshots_load_returns_none() {
        let result: Option<Snapshot<String>> = NoSnapshots.load("test", "id").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn no_snapshots_offer_declines_without_creating() {
        let result = NoSnapshots
            .offer_snapshot::<io::Error, (), _>("test", "id", 100, || {
                panic!("snapshot should not be created")
            })
            .await
            .unwrap();

        assert_eq!(result, SnapshotOffer::Declined);
    }

    #[test]
    fn offer_error_create_displays_source() {
        let err: OfferSnapshotError<io::Error, io::Error> =
            OfferSnapshotError::Create(io::Error::other("create failed"));
        assert!(err.to_string().contains("failed to create snapshot"));
        assert!(err.source().is_some());
    }

    #[test]
    fn offer_error_snapshot_displays_source() {
        let err: OfferSnapshotError<io::Error, io::Error> =
            OfferSnapshotError::Snapshot(io::Error::other("snapshot failed"));
        assert!(err.to_string().contains("snapshot operation failed"));
        assert!(err.source().is_some());
    }
}
