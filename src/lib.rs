#![doc = include_str!("../README.md")]

pub use chronicle_core::{
    aggregate,
    aggregate::{ActionContext, ActionError, AggregateDefinition, AggregateState, Instance},
    concurrency,
    concurrency::ConcurrencyConflict,
    config,
    config::RepositoryConfig,
    directory,
    directory::DefinitionError,
    event,
    event::{DomainEvent, EventKind, RecordedEvent},
    instance,
    instance::{InstanceKey, RegistryError},
    mutex,
    mutex::{LockTimeout, NamedMutex, NamedMutexGuard},
    publish,
    publish::{BoxError, Channel, SubscriberError},
    replay,
    replay::{ReplayError, replay},
    repository,
    repository::{LoadError, Repository, SaveError, SnapshotMode, Snapshots},
};

/// Event store trait and the in-memory store.
pub mod store {
    pub use chronicle_core::store::{EventStore, NonEmpty, StreamEvent, inmemory};
}

/// Snapshot store trait and the in-memory snapshot store.
pub mod snapshot {
    pub use chronicle_core::snapshot::{
        NoSnapshots, OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore, inmemory,
    };
}
