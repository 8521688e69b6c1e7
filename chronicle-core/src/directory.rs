//! Process-wide directory of aggregate definitions.
//!
//! A definition registers itself under its name the first time it creates an
//! instance. Entries are never removed. Looking a definition up by name lets
//! code that only knows the aggregate name (for example a repository reloading
//! a stream) get back to the handlers.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, LazyLock, RwLock},
};

use thiserror::Error;

use crate::aggregate::{AggregateDefinition, AggregateState};

/// Error looking up or registering an aggregate definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// No instance of an aggregate with this name was ever created.
    #[error("aggregate `{name}` is not defined")]
    NotDefined {
        /// Aggregate name.
        name: String,
    },
    /// A different definition already owns this name.
    #[error("aggregate `{name}` is already defined")]
    Duplicate {
        /// Aggregate name.
        name: String,
    },
    /// The name is taken by a definition over another state type.
    #[error("aggregate `{name}` is defined with a different state type")]
    StateTypeMismatch {
        /// Aggregate name.
        name: String,
    },
}

type Entry = Arc<dyn Any + Send + Sync>;

static DIRECTORY: LazyLock<RwLock<HashMap<String, Entry>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register `definition` under its name.
///
/// Registering the same definition (or a clone of it) again is a no-op.
pub(crate) fn register<T: AggregateState>(
    definition: &AggregateDefinition<T>,
) -> Result<(), DefinitionError> {
    let mut directory = DIRECTORY
        .write()
        .expect("aggregate directory lock poisoned");

    if let Some(existing) = directory.get(definition.name()) {
        return match existing.downcast_ref::<AggregateDefinition<T>>() {
            Some(existing) if existing.same_definition(definition) => Ok(()),
            _ => Err(DefinitionError::Duplicate {
                name: definition.name().to_string(),
            }),
        };
    }

    directory.insert(definition.name().to_string(), Arc::new(definition.clone()));
    drop(directory);
    tracing::debug!(aggregate = %definition.name(), "aggregate definition registered");
    Ok(())
}

/// Fetch the definition registered under `name`.
///
/// # Errors
///
/// [`DefinitionError::NotDefined`] if nothing is registered under `name`,
/// [`DefinitionError::StateTypeMismatch`] if the registered definition has a
/// state type other than `T`.
pub fn lookup<T: AggregateState>(name: &str) -> Result<AggregateDefinition<T>, DefinitionError> {
    let directory = DIRECTORY
        .read()
        .expect("aggregate directory lock poisoned");
    let entry = directory
        .get(name)
        .ok_or_else(|| DefinitionError::NotDefined {
            name: name.to_string(),
        })?;
    entry
        .downcast_ref::<AggregateDefinition<T>>()
        .cloned()
        .ok_or_else(|| DefinitionError::StateTypeMismatch {
            name: name.to_string(),
        })
}

/// Whether a definition is registered under `name`.
#[must_use]
pub fn is_defined(name: &str) -> bool {
    DIRECTORY
        .read()
        .expect("aggregate directory lock poisoned")
        .contains_key(name)
}

/// Names of every registered aggregate, sorted.
#[must_use]
pub fn defined_names() -> Vec<String> {
    let mut names: Vec<String> = DIRECTORY
        .read()
        .expect("aggregate directory lock poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort_unstable();
    names
}
