//! Loading and saving aggregate instances.
//!
//! `Repository` serializes every load and save of one aggregate identity
//! through a [`NamedMutex`] keyed `"{aggregate}:{id}"`. A save drains the
//! instance's pending events, lets before-persist subscribers veto the batch,
//! checks the stream version, appends the events, offers a snapshot and
//! finally notifies after-persist subscribers. A load replays history
//! (from a snapshot when one is available) into a fresh instance.
//!
//! Snapshot support is opt-in via `Repository<_, Snapshots<_>>`. This keeps
//! the default repository lightweight: no snapshot work and no serde bounds
//! on aggregate state unless snapshots are enabled.

use std::{convert::Infallible, sync::Arc};

use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    aggregate::{AggregateDefinition, AggregateState, Instance},
    concurrency::ConcurrencyConflict,
    config::RepositoryConfig,
    directory::{self, DefinitionError},
    instance::RegistryError,
    mutex::{LockTimeout, NamedMutex, NamedMutexGuard},
    publish::{BoxError, Channel, SubscriberError, Subscribers},
    replay::{ReplayError, replay},
    snapshot::{NoSnapshots, Snapshot, SnapshotStore},
    store::{EventStore, StreamEvent},
};

/// Error returned by [`Repository::save`].
#[derive(Debug, Error)]
pub enum SaveError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The instance was disposed.
    #[error(transparent)]
    Instance(#[from] RegistryError),
    /// A before-persist subscriber vetoed the batch; nothing was written.
    #[error("save aborted: {0}")]
    BeforePersist(#[from] SubscriberError),
    /// The stream moved on since the instance was loaded.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),
    /// The event store failed.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// The per-aggregate lock was not granted in time.
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
}

/// Error returned by [`Repository::load`] and [`Repository::load_by_name`].
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The stored history could not be replayed.
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// No usable definition is registered under the requested name.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    /// The event store failed.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// The per-aggregate lock was not granted in time.
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
}

/// Snapshot-enabled repository mode wrapper.
#[derive(Clone, Debug)]
pub struct Snapshots<SS>(pub SS);

/// How a repository reads and writes snapshots of `T`.
///
/// Implemented by [`NoSnapshots`] for every state type and by
/// [`Snapshots`] for serializable ones. Snapshot failures never fail a load
/// or save: they are logged and the repository carries on without.
pub trait SnapshotMode<T>: Send + Sync {
    /// Latest usable snapshot of the stream, if any.
    fn load_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> impl Future<Output = Option<Snapshot<T>>> + Send;

    /// Offer `snapshot` of the stream for storage.
    fn persist_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        snapshot: Snapshot<T>,
    ) -> impl Future<Output = ()> + Send;
}

impl<T: AggregateState> SnapshotMode<T> for NoSnapshots {
    async fn load_snapshot(
        &self,
        _aggregate_kind: &str,
        _aggregate_id: &str,
    ) -> Option<Snapshot<T>> {
        None
    }

    async fn persist_snapshot(&self, _aggregate_kind: &str, _aggregate_id: &str, _: Snapshot<T>) {}
}

impl<T, SS> SnapshotMode<T> for Snapshots<SS>
where
    T: AggregateState + Serialize + DeserializeOwned,
    SS: SnapshotStore,
{
    async fn load_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> Option<Snapshot<T>> {
        self.0
            .load(aggregate_kind, aggregate_id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten()
    }

    async fn persist_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        snapshot: Snapshot<T>,
    ) {
        let version = snapshot.version;
        let offer = self
            .0
            .offer_snapshot(aggregate_kind, aggregate_id, version, move || {
                Ok::<_, Infallible>(snapshot)
            })
            .await;
        match offer {
            Ok(offer) => tracing::debug!(version, ?offer, "snapshot offered"),
            Err(e) => tracing::error!(error = %e, version, "failed to persist snapshot"),
        }
    }
}

/// Repository.
pub struct Repository<S, M = NoSnapshots>
where
    S: EventStore,
{
    store: S,
    snapshots: M,
    mutex: NamedMutex,
    subscribers: Subscribers,
    config: RepositoryConfig,
}

impl<S> Repository<S>
where
    S: EventStore,
{
    /// A repository over `store` without snapshots.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            snapshots: NoSnapshots,
            mutex: NamedMutex::new(),
            subscribers: Subscribers::new(),
            config: RepositoryConfig::default(),
        }
    }
}

impl<S, M> std::fmt::Debug for Repository<S, M>
where
    S: EventStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("mutex", &self.mutex)
            .field("subscribers", &self.subscribers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, M> Repository<S, M>
where
    S: EventStore,
{
    /// The underlying event store.
    #[must_use]
    pub const fn event_store(&self) -> &S {
        &self.store
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The lock serializing loads and saves. Clones share the same locks.
    #[must_use]
    pub const fn mutex(&self) -> &NamedMutex {
        &self.mutex
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Share `mutex` with other repositories over the same store.
    #[must_use]
    pub fn with_mutex(mut self, mutex: NamedMutex) -> Self {
        self.mutex = mutex;
        self
    }

    /// Enable snapshots backed by `snapshots`.
    #[must_use]
    pub fn with_snapshots<SS>(self, snapshots: SS) -> Repository<S, Snapshots<SS>>
    where
        SS: SnapshotStore,
    {
        Repository {
            store: self.store,
            snapshots: Snapshots(snapshots),
            mutex: self.mutex,
            subscribers: self.subscribers,
            config: self.config,
        }
    }

    /// Notify `subscriber` before each batch is written. An error aborts
    /// the save.
    #[must_use]
    pub fn on_before_persist<F, Fut>(mut self, subscriber: F) -> Self
    where
        F: Fn(Arc<[StreamEvent]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.subscribers.subscribe(Channel::BeforePersist, subscriber);
        self
    }

    /// Notify `subscriber` after each batch is written. Errors are logged.
    #[must_use]
    pub fn on_after_persist<F, Fut>(mut self, subscriber: F) -> Self
    where
        F: Fn(Arc<[StreamEvent]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.subscribers.subscribe(Channel::AfterPersist, subscriber);
        self
    }

    async fn lock(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> Result<NamedMutexGuard, LockTimeout> {
        let key = format!("{aggregate_kind}:{aggregate_id}");
        match self.config.lock_timeout() {
            Some(timeout) => self.mutex.acquire_timeout(key, timeout).await,
            None => Ok(self.mutex.acquire(key).await),
        }
    }

    /// Persist the events `instance` recorded since it was loaded or last
    /// saved.
    ///
    /// A save with nothing pending touches neither the store nor the
    /// subscribers. Once popped, events are not handed back to the instance
    /// if the save fails; reload and retry instead.
    ///
    /// # Errors
    ///
    /// Returns [`SaveError::BeforePersist`] if a before-persist subscriber
    /// fails, [`SaveError::Concurrency`] if the stream moved since the
    /// instance was loaded, [`SaveError::Store`] if the store fails, and
    /// [`SaveError::Instance`] if the instance was disposed.
    #[tracing::instrument(
        skip(self, instance),
        fields(aggregate = %instance.aggregate_name(), id = %instance.id())
    )]
    pub async fn save<T>(&self, instance: &Instance<T>) -> Result<(), SaveError<S::Error>>
    where
        T: AggregateState,
        M: SnapshotMode<T>,
    {
        let aggregate_kind = instance.aggregate_name();
        let aggregate_id = instance.id();
        let _guard = self.lock(aggregate_kind, aggregate_id).await?;

        // The snapshot must hold exactly the state these events produced,
        // whatever runs on the handle while this save is suspended.
        let (pending, state) = instance.pop_pending_with_state()?;
        let Some(pending) = NonEmpty::from_vec(pending) else {
            tracing::trace!("no pending events, nothing to save");
            return Ok(());
        };
        let events = pending.map(|event| StreamEvent::new(aggregate_kind, aggregate_id, event));
        let batch: Arc<[StreamEvent]> = events.iter().cloned().collect();

        self.subscribers.publish_before(&batch).await?;

        let expected = events.head.version().saturating_sub(1);
        let actual = self
            .store
            .aggregate_version(aggregate_kind, aggregate_id)
            .await
            .map_err(SaveError::Store)?;
        ConcurrencyConflict::check(expected, actual)?;

        let last_version = events.last().version();
        let event_count = events.len();
        self.store
            .save_events(events)
            .await
            .map_err(SaveError::Store)?;
        tracing::debug!(event_count, version = last_version, "events persisted");

        let snapshot = Snapshot {
            version: last_version,
            state,
        };
        self.snapshots
            .persist_snapshot(aggregate_kind, aggregate_id, snapshot)
            .await;
        self.subscribers.publish_after(&batch).await;
        Ok(())
    }

    /// Rebuild the instance `id` of `definition` from the store.
    ///
    /// An id with no history comes back as a fresh instance at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if the store fails and
    /// [`LoadError::Replay`] if the history cannot be replayed.
    #[tracing::instrument(skip(self, definition), fields(aggregate = %definition.name()))]
    pub async fn load<T>(
        &self,
        definition: &AggregateDefinition<T>,
        id: &str,
    ) -> Result<Instance<T>, LoadError<S::Error>>
    where
        T: AggregateState,
        M: SnapshotMode<T>,
    {
        let aggregate_kind = definition.name();
        let _guard = self.lock(aggregate_kind, id).await?;

        let snapshot = self.snapshots.load_snapshot(aggregate_kind, id).await;
        let since_version = snapshot.as_ref().map_or(0, |snapshot| snapshot.version);
        let history = self
            .store
            .load_history(aggregate_kind, id, since_version)
            .await
            .map_err(LoadError::Store)?;
        tracing::trace!(since_version, events = history.len(), "history loaded");

        Ok(replay(definition, id, history, snapshot)?)
    }

    /// [`load`](Self::load) an aggregate known only by name.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Definition`] if no definition with state type `T`
    /// is registered under `aggregate`, otherwise as [`load`](Self::load).
    pub async fn load_by_name<T>(
        &self,
        aggregate: &str,
        id: &str,
    ) -> Result<Instance<T>, LoadError<S::Error>>
    where
        T: AggregateState,
        M: SnapshotMode<T>,
    {
        let definition = directory::lookup::<T>(aggregate)?;
        self.load(&definition, id).await
    }
}

impl<S, SS> Repository<S, Snapshots<SS>>
where
    S: EventStore,
    SS: SnapshotStore,
{
    /// The configured snapshot store.
    #[must_use]
    pub const fn snapshot_store(&self) -> &SS {
        &self.snapshots.0
    }
}
