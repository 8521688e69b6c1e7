//! Live aggregate instance records.
//!
//! Every aggregate handle owns exactly one [`InstanceData`] record, stored in
//! a [`Registry`] under the handle's [`InstanceKey`]. Removing the record (on
//! disposal) makes every later operation through that key fail with
//! [`RegistryError::InstanceDoesNotExist`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use thiserror::Error;

use crate::event::RecordedEvent;

/// Stable identity of one aggregate handle.
///
/// Keys are allocated from a process-wide counter and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey(u64);

impl InstanceKey {
    /// Allocate a fresh key.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error from a registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The handle was disposed, or never created.
    #[error("aggregate instance {0} does not exist")]
    InstanceDoesNotExist(InstanceKey),
    /// A record already exists under the key.
    #[error("aggregate instance {0} already exists")]
    InstanceAlreadyExists(InstanceKey),
}

/// Mutable state behind one aggregate handle.
#[derive(Clone, Debug)]
pub struct InstanceData<T> {
    /// Current aggregate state.
    pub state: T,
    /// Version of the last applied or recorded event, `0` if there is none.
    pub version: u64,
    /// Events recorded since the last [`Registry::pop_pending_events`].
    pub pending_events: Vec<RecordedEvent>,
}

impl<T> InstanceData<T> {
    const fn new(state: T) -> Self {
        Self {
            state,
            version: 0,
            pending_events: Vec::new(),
        }
    }

    /// Bump the version and buffer an event carrying it.
    pub fn push_event(&mut self, name: impl Into<String>, payload: Value) -> u64 {
        self.version += 1;
        self.pending_events
            .push(RecordedEvent::new(name, payload, self.version));
        self.version
    }
}

/// Map from handle key to its live record.
pub struct Registry<T> {
    records: Mutex<HashMap<InstanceKey, InstanceData<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.len())
            .finish()
    }
}

impl<T> Registry<T> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InstanceAlreadyExists`] if `key` is taken.
    pub fn create(&self, key: InstanceKey, initial_state: T) -> Result<(), RegistryError> {
        let mut records = self.records();
        if records.contains_key(&key) {
            return Err(RegistryError::InstanceAlreadyExists(key));
        }
        records.insert(key, InstanceData::new(initial_state));
        Ok(())
    }

    /// Overwrite state and version of a fresh record, e.g. from a snapshot.
    pub fn restore(&self, key: InstanceKey, version: u64, state: T) -> Result<(), RegistryError> {
        self.update(key, |record| {
            record.state = state;
            record.version = version;
        })
    }

    /// Run `f` against the live record while holding the registry lock.
    ///
    /// `f` must not call back into this registry.
    pub fn update<R>(
        &self,
        key: InstanceKey,
        f: impl FnOnce(&mut InstanceData<T>) -> R,
    ) -> Result<R, RegistryError> {
        let mut records = self.records();
        let record = records
            .get_mut(&key)
            .ok_or(RegistryError::InstanceDoesNotExist(key))?;
        Ok(f(record))
    }

    /// Buffer an event without touching the state. Returns the new version.
    pub fn record_event(
        &self,
        key: InstanceKey,
        name: impl Into<String>,
        payload: Value,
    ) -> Result<u64, RegistryError> {
        self.update(key, |record| record.push_event(name, payload))
    }

    /// Take every event recorded since the previous call.
    pub fn pop_pending_events(&self, key: InstanceKey) -> Result<Vec<RecordedEvent>, RegistryError> {
        self.update(key, |record| std::mem::take(&mut record.pending_events))
    }

    /// Current version of the record.
    pub fn version(&self, key: InstanceKey) -> Result<u64, RegistryError> {
        self.update(key, |record| record.version)
    }

    /// Remove the record. Returns whether one was present.
    pub fn dispose(&self, key: InstanceKey) -> bool {
        self.records().remove(&key).is_some()
    }

    /// Whether a record exists under `key`.
    #[must_use]
    pub fn contains(&self, key: InstanceKey) -> bool {
        self.records().contains_key(&key)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Whether no records are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Handlers run under this lock; one that panics must not wedge every
    // other instance of the aggregate.
    fn records(&self) -> MutexGuard<'_, HashMap<InstanceKey, InstanceData<T>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Registry<T> {
    /// Copy of the whole record.
    pub fn get(&self, key: InstanceKey) -> Result<InstanceData<T>, RegistryError> {
        self.update(key, |record| record.clone())
    }

    /// Copy of the current state.
    pub fn state(&self, key: InstanceKey) -> Result<T, RegistryError> {
        self.update(key, |record| record.state.clone())
    }

    /// Take the pending events along with the state they produced, in one
    /// step.
    pub fn pop_pending_with_state(
        &self,
        key: InstanceKey,
    ) -> Result<(Vec<RecordedEvent>, T), RegistryError> {
        self.update(key, |record| {
            (
                std::mem::take(&mut record.pending_events),
                record.state.clone(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry_with(state: i64) -> (Registry<i64>, InstanceKey) {
        let registry = Registry::new();
        let key = InstanceKey::next();
        registry.create(key, state).unwrap();
        (registry, key)
    }

    #[test]
    fn create_starts_at_version_zero_with_no_pending_events() {
        let (registry, key) = registry_with(7);
        let record = registry.get(key).unwrap();
        assert_eq!(record.state, 7);
        assert_eq!(record.version, 0);
        assert!(record.pending_events.is_empty());
    }

    #[test]
    fn pop_with_state_takes_events_and_copies_state() {
        let (registry, key) = registry_with(3);
        registry.record_event(key, "a", json!(1)).unwrap();
        registry.update(key, |record| record.state = 4).unwrap();

        let (events, state) = registry.pop_pending_with_state(key).unwrap();
        registry.update(key, |record| record.state = 5).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(state, 4);
        assert!(registry.get(key).unwrap().pending_events.is_empty());
    }

    #[test]
    fn create_twice_fails() {
        let (registry, key) = registry_with(0);
        assert_eq!(
            registry.create(key, 1),
            Err(RegistryError::InstanceAlreadyExists(key))
        );
    }

    #[test]
    fn record_event_bumps_version_without_touching_state() {
        let (registry, key) = registry_with(1);

        assert_eq!(registry.record_event(key, "a", json!(1)).unwrap(), 1);
        assert_eq!(registry.record_event(key, "b", json!(2)).unwrap(), 2);

        let record = registry.get(key).unwrap();
        assert_eq!(record.state, 1);
        assert_eq!(record.version, 2);
        let versions: Vec<u64> = record.pending_events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn pop_pending_events_drains_buffer() {
        let (registry, key) = registry_with(0);
        registry.record_event(key, "a", json!(null)).unwrap();

        assert_eq!(registry.pop_pending_events(key).unwrap().len(), 1);
        assert!(registry.pop_pending_events(key).unwrap().is_empty());
        assert_eq!(registry.version(key).unwrap(), 1);
    }

    #[test]
    fn restore_sets_version_and_state() {
        let (registry, key) = registry_with(0);
        registry.restore(key, 5, 42).unwrap();
        assert_eq!(registry.version(key).unwrap(), 5);
        assert_eq!(registry.state(key).unwrap(), 42);
        assert_eq!(registry.record_event(key, "next", json!(null)).unwrap(), 6);
    }

    #[test]
    fn disposed_records_reject_every_operation() {
        let (registry, key) = registry_with(0);
        assert!(registry.dispose(key));
        assert!(!registry.dispose(key));

        let missing = RegistryError::InstanceDoesNotExist(key);
        assert_eq!(registry.get(key).unwrap_err(), missing);
        assert_eq!(registry.record_event(key, "a", json!(null)), Err(missing.clone()));
        assert_eq!(registry.pop_pending_events(key), Err(missing));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_key_does_not_exist() {
        let registry: Registry<()> = Registry::new();
        let key = InstanceKey::next();
        assert!(matches!(
            registry.version(key),
            Err(RegistryError::InstanceDoesNotExist(k)) if k == key
        ));
    }
}
