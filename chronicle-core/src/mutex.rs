//! Asynchronous mutual exclusion keyed by string.
//!
//! [`NamedMutex`] serializes critical sections that share a key while letting
//! sections for different keys run concurrently. Waiters for a key are granted
//! the lock strictly in arrival order, and the lock is released when the
//! returned [`NamedMutexGuard`] is dropped, whichever way the critical section
//! exits.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use chronicle_core::mutex::NamedMutex;
//!
//! let mutex = NamedMutex::new();
//! {
//!     let _guard = mutex.acquire("order:42").await;
//!     assert!(mutex.is_locked("order:42"));
//! }
//! assert!(!mutex.is_locked("order:42"));
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;

/// Error returned by [`NamedMutex::acquire_timeout`] when the lock could not be
/// obtained in time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {timeout:?} waiting for lock `{key}`")]
pub struct LockTimeout {
    /// The key that could not be locked.
    pub key: String,
    /// How long the caller waited.
    pub timeout: Duration,
}

#[derive(Default)]
struct KeyState {
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Keyed asynchronous mutex.
///
/// A key is locked exactly while it has an entry in the map; the entry holds
/// the FIFO queue of tasks waiting for it.
///
/// Cloning is cheap and yields a handle to the same set of locks.
#[derive(Clone, Default)]
pub struct NamedMutex {
    keys: Arc<Mutex<HashMap<String, KeyState>>>,
    next_ticket: Arc<AtomicU64>,
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("locked_keys", &self.lock_keys().len())
            .finish_non_exhaustive()
    }
}

impl NamedMutex {
    /// A mutex with no keys locked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the caller holds the lock for `key`.
    ///
    /// Never fails. Concurrent calls for the same key complete in the order
    /// they were made. Dropping the returned future before it completes gives
    /// up the place in the queue; if the lock had already been handed over it
    /// is passed on to the next waiter.
    pub async fn acquire(&self, key: impl Into<String>) -> NamedMutexGuard {
        let key = key.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let receiver = {
            let mut keys = self.lock_keys();
            if let Some(state) = keys.get_mut(&key) {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                Some(receiver)
            } else {
                keys.insert(key.clone(), KeyState::default());
                None
            }
        };

        if let Some(receiver) = receiver {
            tracing::trace!(%key, ticket, "lock busy, queued");
            Waiter {
                mutex: self,
                key: &key,
                receiver,
                granted: false,
            }
            .wait()
            .await;
        }

        tracing::trace!(%key, ticket, "lock acquired");
        NamedMutexGuard {
            mutex: self.clone(),
            key,
            ticket,
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockTimeout`] if the lock was not granted in time. The caller
    /// is removed from the queue in that case.
    pub async fn acquire_timeout(
        &self,
        key: impl Into<String>,
        timeout: Duration,
    ) -> Result<NamedMutexGuard, LockTimeout> {
        let key = key.into();
        tokio::time::timeout(timeout, self.acquire(key.clone()))
            .await
            .map_err(|_| {
                tracing::debug!(%key, ?timeout, "lock wait timed out");
                LockTimeout { key, timeout }
            })
    }

    /// Whether some caller currently holds the lock for `key`.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.lock_keys().contains_key(key)
    }

    /// Number of callers queued behind the current holder of `key`.
    #[must_use]
    pub fn queue_len(&self, key: &str) -> usize {
        self.lock_keys()
            .get(key)
            .map_or(0, |state| state.waiters.len())
    }

    /// Hand the lock for `key` to the oldest waiter still interested in it, or
    /// unlock the key if nobody is waiting.
    fn release(&self, key: &str) {
        let mut keys = self.lock_keys();
        let Some(state) = keys.get_mut(key) else {
            return;
        };
        while let Some(next) = state.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        keys.remove(key);
    }

    // A guard may release while its thread is unwinding, so poisoning must not
    // turn into a second panic.
    fn lock_keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A queued acquisition.
struct Waiter<'a> {
    mutex: &'a NamedMutex,
    key: &'a str,
    receiver: oneshot::Receiver<()>,
    granted: bool,
}

impl Waiter<'_> {
    async fn wait(mut self) {
        // The sender is only consumed by `release`, which always sends.
        let _ = (&mut self.receiver).await;
        self.granted = true;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.receiver.close();
        if self.receiver.try_recv().is_ok() {
            tracing::trace!(key = %self.key, "abandoned waiter passing lock on");
            self.mutex.release(self.key);
        }
    }
}

/// Proof of holding a [`NamedMutex`] key. Releases the key on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedMutexGuard {
    mutex: NamedMutex,
    key: String,
    ticket: u64,
}

impl NamedMutexGuard {
    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sequence number assigned when the acquisition was requested.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl std::fmt::Debug for NamedMutexGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutexGuard")
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        tracing::trace!(key = %self.key, ticket = self.ticket, "lock released");
        self.mutex.release(&self.key);
    }
}
