//! Rebuilding live instances from stored history.
//!
//! [`replay`] creates a fresh instance of a definition, optionally seeds it
//! from a [`Snapshot`], and folds the remaining events through the
//! definition's handlers. Replayed events are applied, not recorded: the
//! instance comes back with no pending events.

use thiserror::Error;

use crate::{
    aggregate::{AggregateDefinition, AggregateState, Instance},
    directory::DefinitionError,
    event::RecordedEvent,
    instance::RegistryError,
    snapshot::Snapshot,
};

/// Error rebuilding an instance from its history.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// History exists but the definition cannot apply any event.
    #[error("cannot load aggregate `{aggregate}`: no event handlers are defined")]
    NoEventHandlers {
        /// Aggregate name.
        aggregate: String,
    },
    /// The first event after the snapshot has the wrong version.
    #[error("loaded events don't start right after snapshot: expected version {expected}, found {found}")]
    NotAfterSnapshot {
        /// Snapshot version plus one, or 1 without a snapshot.
        expected: u64,
        /// Version of the first remaining event.
        found: u64,
    },
    /// Two consecutive events are not one version apart.
    #[error("loaded events are not continuous: expected version {expected}, found {found}")]
    NotContinuous {
        /// Version that should have come next.
        expected: u64,
        /// Version that did.
        found: u64,
    },
    /// The history holds an event the definition has no handler for.
    #[error("handler not defined for aggregate `{aggregate}`: event `{event}`")]
    HandlerNotDefined {
        /// Aggregate name.
        aggregate: String,
        /// Event name.
        event: String,
    },
    /// A handler could not decode an event payload.
    #[error("event `{event}` at version {version} could not be applied")]
    Decode {
        /// Event name.
        event: String,
        /// Event version.
        version: u64,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The definition could not be registered.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    /// The instance record vanished mid-replay.
    #[error(transparent)]
    Instance(#[from] RegistryError),
}

/// Rebuild an instance of `definition` from `history`.
///
/// `history` may arrive in any order; it is sorted by version first. When a
/// snapshot is given, events at or below its version are skipped and the
/// rest must start at `snapshot.version + 1`. Without one they must start at
/// 1. Either way they must be gap-free.
///
/// On error no instance survives: the partially built one is disposed.
///
/// # Errors
///
/// See [`ReplayError`].
#[tracing::instrument(
    skip(definition, history, snapshot),
    fields(aggregate = %definition.name(), events = history.len())
)]
pub fn replay<T, E>(
    definition: &AggregateDefinition<T>,
    id: impl Into<String> + std::fmt::Debug,
    history: Vec<E>,
    snapshot: Option<Snapshot<T>>,
) -> Result<Instance<T>, ReplayError>
where
    T: AggregateState,
    E: AsRef<RecordedEvent>,
{
    let instance = definition.create(id)?;
    let registry = definition.registry();

    let base_version = match snapshot {
        Some(snapshot) => {
            let version = snapshot.version;
            registry.restore(instance.key(), version, snapshot.state)?;
            Some(version)
        }
        None => None,
    };

    if history.is_empty() {
        return Ok(instance);
    }
    if !definition.has_event_handlers() {
        return Err(ReplayError::NoEventHandlers {
            aggregate: definition.name().to_string(),
        });
    }

    let mut events: Vec<&RecordedEvent> = history
        .iter()
        .map(AsRef::as_ref)
        .filter(|event| base_version.is_none_or(|base| event.version > base))
        .collect();
    events.sort_by_key(|event| event.version);

    let Some(first) = events.first() else {
        tracing::debug!("snapshot covers the whole history");
        return Ok(instance);
    };
    let expected = base_version.unwrap_or(0) + 1;
    if first.version != expected {
        return Err(ReplayError::NotAfterSnapshot {
            expected,
            found: first.version,
        });
    }
    if let Some(pair) = events
        .windows(2)
        .find(|pair| pair[1].version != pair[0].version + 1)
    {
        return Err(ReplayError::NotContinuous {
            expected: pair[0].version + 1,
            found: pair[1].version,
        });
    }

    registry.update(instance.key(), |record| {
        for event in &events {
            let handler =
                definition
                    .event_handler(&event.name)
                    .ok_or_else(|| ReplayError::HandlerNotDefined {
                        aggregate: definition.name().to_string(),
                        event: event.name.clone(),
                    })?;
            handler(&mut record.state, &event.payload).map_err(|source| ReplayError::Decode {
                event: event.name.clone(),
                version: event.version,
                source,
            })?;
            record.version = event.version;
        }
        Ok::<_, ReplayError>(())
    })??;

    tracing::debug!(version = ?instance.version(), "instance replayed");
    Ok(instance)
}
