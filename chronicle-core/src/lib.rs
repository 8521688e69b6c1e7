//! Core types for the chronicle event-sourcing runtime.
//!
//! - [`aggregate`] - Aggregate definitions, instance handles and actions
//! - [`directory`] - Process-wide lookup of definitions by name
//! - [`instance`] - Versioned instance records (`Registry`)
//! - [`replay`] - Rebuilding instances from history and snapshots
//! - [`repository`] - Serialized load/save with optimistic concurrency
//! - [`store`] - Event persistence abstraction (`EventStore`)
//! - [`snapshot`] - Snapshot storage abstraction (`SnapshotStore`)
//! - [`publish`] - Before/after persist subscribers
//! - [`mutex`] - Keyed asynchronous mutex
//! - [`event`] - Recorded events and the `DomainEvent` marker
//! - [`concurrency`] - Concurrency conflict error
//! - [`config`] - Repository configuration
//!
//! # Example
//!
//! ```
//! use chronicle_core::{repository::Repository, store::inmemory};
//!
//! let repo = Repository::new(inmemory::Store::new());
//! assert!(repo.config().lock_timeout().is_none());
//! ```
//!
//! Most users should depend on the `chronicle` crate, which re-exports these
//! types.

pub mod aggregate;
pub mod concurrency;
pub mod config;
pub mod directory;
pub mod event;
pub mod instance;
pub mod mutex;
pub mod publish;
pub mod replay;
pub mod repository;
pub mod snapshot;
pub mod store;
