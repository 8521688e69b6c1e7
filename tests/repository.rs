//! Integration tests for repository functionality.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chronicle::{
    AggregateDefinition, DomainEvent, LoadError, ReplayError, Repository, RepositoryConfig,
    SaveError,
    snapshot::{
        OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore,
        inmemory::Store as InMemorySnapshotStore,
    },
    store::{EventStore, NonEmpty, StreamEvent, inmemory},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;

// ============================================================================
// Test Domain: Counter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ValueAdded {
    amount: i32,
}

impl DomainEvent for ValueAdded {
    const KIND: &'static str = "value-added";
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Counter {
    value: i32,
}

fn counter(name: &str) -> AggregateDefinition<Counter> {
    AggregateDefinition::builder(name, Counter::default)
        .on(|state: &mut Counter, event: &ValueAdded| state.value += event.amount)
        .action("add", |ctx, payload| {
            let amount: i32 = serde_json::from_value(payload)?;
            ctx.record(&ValueAdded { amount })
        })
        .build()
}

fn value_added(kind: &str, id: &str, version: u64, amount: i32) -> StreamEvent {
    StreamEvent::new(
        kind,
        id,
        chronicle::RecordedEvent::new(ValueAdded::KIND, json!({ "amount": amount }), version),
    )
}

// ============================================================================
// Custom Snapshot Stores for Testing
// ============================================================================

#[derive(Debug, Error)]
#[error("snapshot load failed")]
struct SnapshotLoadError;

#[derive(Debug)]
struct FailingLoadSnapshotStore {
    offered: AtomicBool,
}

impl FailingLoadSnapshotStore {
    const fn new() -> Self {
        Self {
            offered: AtomicBool::new(false),
        }
    }
}

impl SnapshotStore for FailingLoadSnapshotStore {
    type Error = SnapshotLoadError;

    async fn load<T>(&self, _: &str, _: &str) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        Err(SnapshotLoadError)
    }

    async fn offer_snapshot<CE, T, Create>(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        self.offered.store(true, Ordering::Relaxed);
        Err(OfferSnapshotError::Snapshot(SnapshotLoadError))
    }
}

/// Always hands out the same snapshot, whatever the stream.
#[derive(Debug)]
struct FixedSnapshotStore {
    version: u64,
    state: serde_json::Value,
}

impl SnapshotStore for FixedSnapshotStore {
    type Error = serde_json::Error;

    async fn load<T>(&self, _: &str, _: &str) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        Ok(Some(Snapshot {
            version: self.version,
            state: serde_json::from_value(self.state.clone())?,
        }))
    }

    async fn offer_snapshot<CE, T, Create>(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        Ok(SnapshotOffer::Declined)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn save_and_load_round_trip() {
    let definition = counter("repo-round-trip");
    let repo = Repository::new(inmemory::Store::new());

    let instance = definition.create("c1").unwrap();
    instance.invoke("add", json!(5)).unwrap();
    instance.invoke("add", json!(7)).unwrap();
    repo.save(&instance).await.unwrap();

    assert_eq!(
        repo.event_store()
            .aggregate_version("repo-round-trip", "c1")
            .await
            .unwrap(),
        2
    );
    let loaded = repo.load(&definition, "c1").await.unwrap();
    assert_eq!(loaded.state().unwrap(), Counter { value: 12 });
    assert_eq!(loaded.version().unwrap(), 2);
}

#[tokio::test]
async fn loaded_instance_keeps_saving() {
    let definition = counter("repo-keeps-saving");
    let repo = Repository::new(inmemory::Store::new());

    let first = definition.create("c1").unwrap();
    first.invoke("add", json!(1)).unwrap();
    repo.save(&first).await.unwrap();

    let loaded = repo.load(&definition, "c1").await.unwrap();
    loaded.invoke("add", json!(2)).unwrap();
    repo.save(&loaded).await.unwrap();

    let events = repo.event_store().events("repo-keeps-saving", "c1");
    let versions: Vec<u64> = events.iter().map(StreamEvent::version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn save_with_no_pending_events_touches_nothing() {
    let definition = counter("repo-no-op");
    let repo = Repository::new(inmemory::Store::new())
        .with_snapshots(InMemorySnapshotStore::always());

    let instance = definition.create("c1").unwrap();
    repo.save(&instance).await.unwrap();

    assert_eq!(repo.event_store().stream_count(), 0);
    assert_eq!(repo.snapshot_store().snapshot_version("repo-no-op", "c1"), None);
}

#[tokio::test]
async fn concurrent_first_saves_conflict_exactly_once() {
    let definition = counter("repo-concurrent");
    let repo = Repository::new(inmemory::Store::new());

    let a = definition.create("c1").unwrap();
    let b = definition.create("c1").unwrap();
    a.invoke("add", json!(1)).unwrap();
    b.invoke("add", json!(2)).unwrap();

    let (first, second) = tokio::join!(repo.save(&a), repo.save(&b));

    let conflicts = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(SaveError::Concurrency(_))))
        .count();
    assert_eq!(conflicts, 1);
    assert!(first.is_ok() || second.is_ok());
    assert_eq!(repo.event_store().events("repo-concurrent", "c1").len(), 1);
}

#[tokio::test]
async fn conflict_message_suggests_reload() {
    let definition = counter("repo-conflict-message");
    let repo = Repository::new(inmemory::Store::new());

    let stale = definition.create("c1").unwrap();
    let fresh = definition.create("c1").unwrap();
    fresh.invoke("add", json!(1)).unwrap();
    repo.save(&fresh).await.unwrap();

    stale.invoke("add", json!(1)).unwrap();
    let err = repo.save(&stale).await.unwrap_err();

    assert!(err.to_string().contains("reload and retry"));
    // Popped events are not handed back.
    assert!(stale.pending_events().unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_plus_events_replays_to_combined_version() {
    let definition = counter("repo-snapshot-replay");
    let store = inmemory::Store::new();
    store
        .save_events(
            NonEmpty::from_vec(
                (1..=5)
                    .map(|version| value_added("repo-snapshot-replay", "c1", version, 1))
                    .collect(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let repo = Repository::new(store).with_snapshots(FixedSnapshotStore {
        version: 3,
        state: json!({ "value": 100 }),
    });

    let loaded = repo.load(&definition, "c1").await.unwrap();

    assert_eq!(loaded.version().unwrap(), 5);
    assert_eq!(loaded.state().unwrap(), Counter { value: 102 });
}

#[tokio::test]
async fn every_n_snapshots_are_used_on_load() {
    let definition = counter("repo-every-n");
    let repo = Repository::new(inmemory::Store::new())
        .with_snapshots(InMemorySnapshotStore::every(3));

    let instance = definition.create("c1").unwrap();
    for amount in 1..=3 {
        instance.invoke("add", json!(amount)).unwrap();
    }
    repo.save(&instance).await.unwrap();
    instance.invoke("add", json!(10)).unwrap();
    repo.save(&instance).await.unwrap();

    assert_eq!(
        repo.snapshot_store().snapshot_version("repo-every-n", "c1"),
        Some(3)
    );
    let loaded = repo.load(&definition, "c1").await.unwrap();
    assert_eq!(loaded.version().unwrap(), 4);
    assert_eq!(loaded.state().unwrap(), Counter { value: 16 });
}

#[tokio::test]
async fn snapshot_ignores_actions_run_during_save() {
    let definition = counter("repo-snapshot-mid-save");
    let instance = Arc::new(definition.create("c1").unwrap());
    let handle = Arc::clone(&instance);
    let repo = Repository::new(inmemory::Store::new())
        .with_snapshots(InMemorySnapshotStore::always())
        .on_before_persist(move |_| {
            handle.invoke("add", json!(100)).unwrap();
            async { Ok(()) }
        });

    instance.invoke("add", json!(1)).unwrap();
    repo.save(&instance).await.unwrap();

    assert_eq!(
        repo.snapshot_store()
            .snapshot_version("repo-snapshot-mid-save", "c1"),
        Some(1)
    );
    let loaded = repo.load(&definition, "c1").await.unwrap();
    assert_eq!(loaded.version().unwrap(), 1);
    assert_eq!(loaded.state().unwrap(), Counter { value: 1 });
    // The action run during the save is still pending on the live handle.
    assert_eq!(instance.pending_events().unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_failures_do_not_fail_load_or_save() {
    let definition = counter("repo-snapshot-failure");
    let repo = Repository::new(inmemory::Store::new())
        .with_snapshots(FailingLoadSnapshotStore::new());

    let instance = definition.create("c1").unwrap();
    instance.invoke("add", json!(4)).unwrap();
    repo.save(&instance).await.unwrap();
    assert!(repo.snapshot_store().offered.load(Ordering::Relaxed));

    let loaded = repo.load(&definition, "c1").await.unwrap();
    assert_eq!(loaded.state().unwrap(), Counter { value: 4 });
}

#[tokio::test]
async fn unknown_event_in_history_fails_load() {
    let definition = counter("repo-unknown-event");
    let store = inmemory::Store::new();
    store
        .save_events(NonEmpty::new(StreamEvent::new(
            "repo-unknown-event",
            "c1",
            chronicle::RecordedEvent::new("value-removed", json!({ "amount": 1 }), 1),
        )))
        .await
        .unwrap();
    let repo = Repository::new(store);

    let err = repo.load(&definition, "c1").await.unwrap_err();

    assert!(matches!(
        err,
        LoadError::Replay(ReplayError::HandlerNotDefined { .. })
    ));
    assert_eq!(definition.live_instances(), 0);
}

#[tokio::test]
async fn load_by_name_uses_registered_definition() {
    let definition = counter("repo-by-name");
    let repo = Repository::new(inmemory::Store::new());

    let instance = definition.create("c1").unwrap();
    instance.invoke("add", json!(9)).unwrap();
    repo.save(&instance).await.unwrap();

    let loaded = repo.load_by_name::<Counter>("repo-by-name", "c1").await.unwrap();
    assert_eq!(loaded.state().unwrap(), Counter { value: 9 });

    let err = repo
        .load_by_name::<Counter>("repo-never-defined", "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Definition(_)));
}

#[tokio::test]
async fn lock_timeout_is_honoured() {
    let definition = counter("repo-lock-timeout");
    let repo = Repository::new(inmemory::Store::new())
        .with_config(RepositoryConfig::default().with_lock_timeout(Duration::from_millis(20)));

    let guard = repo.mutex().acquire("repo-lock-timeout:c1").await;
    let err = repo.load(&definition, "c1").await.unwrap_err();
    assert!(matches!(err, LoadError::LockTimeout(_)));

    drop(guard);
    assert!(repo.load(&definition, "c1").await.is_ok());
}

#[tokio::test]
async fn different_ids_do_not_block_each_other() {
    let definition = counter("repo-independent-ids");
    let repo = Repository::new(inmemory::Store::new())
        .with_config(RepositoryConfig::default().with_lock_timeout(Duration::from_millis(50)));

    let _held = repo.mutex().acquire("repo-independent-ids:c1").await;
    let loaded = repo.load(&definition, "c2").await.unwrap();

    assert_eq!(loaded.id(), "c2");
}
