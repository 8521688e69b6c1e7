//! Command-side domain primitives.
//!
//! An [`AggregateDefinition`] bundles everything needed to run one kind of
//! aggregate: its name, an initial-state factory, the event handlers that
//! mutate state, and the actions that validate business rules and record
//! events. Definitions hand out [`Instance`] handles; each handle owns one
//! versioned record in the definition's [`Registry`].
//!
//! ```
//! use chronicle_core::aggregate::{ActionError, AggregateDefinition};
//! use serde_json::json;
//!
//! #[derive(Clone, Default)]
//! struct Counter {
//!     total: i64,
//! }
//!
//! let counter = AggregateDefinition::builder("doc-counter", Counter::default)
//!     .event("Added", |state: &mut Counter, payload| {
//!         state.total += payload["amount"].as_i64().unwrap_or_default();
//!     })
//!     .action("add", |ctx, payload| {
//!         if payload["amount"].as_i64().unwrap_or_default() <= 0 {
//!             return Err(ActionError::rejected("amount must be positive"));
//!         }
//!         ctx.record_that("Added", payload)
//!     })
//!     .build();
//!
//! let instance = counter.create("c-1").unwrap();
//! instance.invoke("add", json!({ "amount": 5 })).unwrap();
//! assert_eq!(instance.state().unwrap().total, 5);
//! assert_eq!(instance.version().unwrap(), 1);
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{
    directory::{self, DefinitionError},
    event::{DomainEvent, RecordedEvent},
    instance::{InstanceKey, Registry, RegistryError},
};

/// Bounds every aggregate state type satisfies.
///
/// Reads hand out clones of the live state, so `Clone` is required; the rest
/// lets instances move between tasks.
pub trait AggregateState: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> AggregateState for T {}

type StateFactory<T> = Arc<dyn Fn() -> T + Send + Sync>;
pub(crate) type EventHandler<T> =
    Arc<dyn Fn(&mut T, &Value) -> Result<(), serde_json::Error> + Send + Sync>;
type Action<T> =
    Arc<dyn Fn(&ActionContext<'_, T>, Value) -> Result<(), ActionError> + Send + Sync>;

/// Error returned by [`Instance::invoke`] and the recording operations of
/// [`ActionContext`].
#[derive(Debug, Error)]
pub enum ActionError {
    /// No action is registered under the invoked name.
    #[error("aggregate `{aggregate}` has no action named `{action}`")]
    UnknownAction {
        /// Name of the aggregate definition.
        aggregate: String,
        /// Action name that was invoked.
        action: String,
    },
    /// The instance record is gone.
    #[error(transparent)]
    Instance(#[from] RegistryError),
    /// The payload or a recorded event could not be (de)serialized.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// The action refused to run against the current state.
    #[error("action rejected: {0}")]
    Rejected(String),
}

impl ActionError {
    /// Shorthand for [`ActionError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Builder returned by [`AggregateDefinition::builder`].
pub struct AggregateBuilder<T> {
    name: String,
    initial_state: StateFactory<T>,
    events: HashMap<String, EventHandler<T>>,
    actions: HashMap<String, Action<T>>,
}

impl<T: AggregateState> AggregateBuilder<T> {
    /// Handle the event `name` with its raw JSON payload.
    ///
    /// Registering a second handler under the same name replaces the first.
    #[must_use]
    pub fn event<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut T, &Value) + Send + Sync + 'static,
    {
        self.events.insert(
            name.into(),
            Arc::new(move |state, payload| {
                handler(state, payload);
                Ok(())
            }),
        );
        self
    }

    /// Handle the typed event `E`, registered under [`DomainEvent::KIND`].
    ///
    /// Payloads that do not decode as `E` are rejected before the handler
    /// runs.
    #[must_use]
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: DomainEvent + DeserializeOwned,
        F: Fn(&mut T, &E) + Send + Sync + 'static,
    {
        self.events.insert(
            E::KIND.to_string(),
            Arc::new(move |state, payload| {
                let event = E::deserialize(payload)?;
                handler(state, &event);
                Ok(())
            }),
        );
        self
    }

    /// Expose `action` on every instance.
    #[must_use]
    pub fn action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&ActionContext<'_, T>, Value) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    /// Finish the definition.
    #[must_use]
    pub fn build(self) -> AggregateDefinition<T> {
        AggregateDefinition {
            inner: Arc::new(Definition {
                name: self.name,
                initial_state: self.initial_state,
                events: self.events,
                actions: self.actions,
                registry: Registry::new(),
                registered: OnceLock::new(),
            }),
        }
    }
}

struct Definition<T> {
    name: String,
    initial_state: StateFactory<T>,
    events: HashMap<String, EventHandler<T>>,
    actions: HashMap<String, Action<T>>,
    registry: Registry<T>,
    registered: OnceLock<()>,
}

/// Immutable description of one aggregate type.
///
/// Cloning is cheap; clones share the same handlers and instance registry.
pub struct AggregateDefinition<T> {
    inner: Arc<Definition<T>>,
}

impl<T> Clone for AggregateDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AggregateDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&str> = self.inner.events.keys().map(String::as_str).collect();
        events.sort_unstable();
        let mut actions: Vec<&str> = self.inner.actions.keys().map(String::as_str).collect();
        actions.sort_unstable();
        f.debug_struct("AggregateDefinition")
            .field("name", &self.inner.name)
            .field("events", &events)
            .field("actions", &actions)
            .finish_non_exhaustive()
    }
}

impl<T: AggregateState> AggregateDefinition<T> {
    /// Start defining the aggregate `name`. Every new instance starts from a
    /// fresh `initial_state()`.
    pub fn builder<F>(name: impl Into<String>, initial_state: F) -> AggregateBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        AggregateBuilder {
            name: name.into(),
            initial_state: Arc::new(initial_state),
            events: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Create a live instance with the initial state at version 0.
    ///
    /// The first call registers the definition in the process-wide
    /// [`directory`].
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Duplicate`] if another definition was
    /// already registered under this name.
    pub fn create(&self, id: impl Into<String>) -> Result<Instance<T>, DefinitionError> {
        self.register()?;

        let key = InstanceKey::next();
        // Keys are never reused, so the slot is always free.
        let _ = self.inner.registry.create(key, (self.inner.initial_state)());

        let instance = Instance {
            definition: self.clone(),
            key,
            id: id.into(),
        };
        tracing::trace!(aggregate = %self.name(), id = %instance.id, %key, "instance created");
        Ok(instance)
    }

    fn register(&self) -> Result<(), DefinitionError> {
        if self.inner.registered.get().is_none() {
            directory::register(self)?;
            let _ = self.inner.registered.set(());
        }
        Ok(())
    }
}

impl<T> AggregateDefinition<T> {
    /// Name the definition is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether any event handler is registered. Loading requires one.
    #[must_use]
    pub fn has_event_handlers(&self) -> bool {
        !self.inner.events.is_empty()
    }

    /// Whether an event handler is registered under `event`.
    #[must_use]
    pub fn handles(&self, event: &str) -> bool {
        self.inner.events.contains_key(event)
    }

    /// Names of the events this definition handles, in no particular order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.inner.events.keys().map(String::as_str)
    }

    /// Names of the registered actions, in no particular order.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.inner.actions.keys().map(String::as_str)
    }

    /// Number of instances of this definition that have not been disposed.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether `self` and `other` are clones of the same definition.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn event_handler(&self, event: &str) -> Option<&EventHandler<T>> {
        self.inner.events.get(event)
    }

    pub(crate) fn registry(&self) -> &Registry<T> {
        &self.inner.registry
    }
}

/// Handle to one live aggregate instance.
///
/// The handle owns no state itself; its record lives in the definition's
/// registry until [`dispose`](Self::dispose) is called or the handle is
/// dropped.
pub struct Instance<T> {
    definition: AggregateDefinition<T>,
    key: InstanceKey,
    id: String,
}

impl<T> fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("aggregate", &self.aggregate_name())
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl<T> Instance<T> {
    /// Identity of the instance within its aggregate.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the aggregate this instance belongs to.
    #[must_use]
    pub fn aggregate_name(&self) -> &str {
        self.definition.name()
    }

    /// Registry key of the record backing this handle.
    #[must_use]
    pub const fn key(&self) -> InstanceKey {
        self.key
    }

    /// Definition this instance was created from.
    #[must_use]
    pub const fn definition(&self) -> &AggregateDefinition<T> {
        &self.definition
    }

    /// Version after the last recorded or replayed event; 0 when fresh.
    pub fn version(&self) -> Result<u64, RegistryError> {
        self.definition.registry().version(self.key)
    }

    /// Take the events recorded since the previous call.
    pub fn pop_pending_events(&self) -> Result<Vec<RecordedEvent>, RegistryError> {
        self.definition.registry().pop_pending_events(self.key)
    }

    /// Release the instance record. Every later operation on this handle
    /// fails with [`RegistryError::InstanceDoesNotExist`].
    pub fn dispose(&self) {
        if self.definition.registry().dispose(self.key) {
            tracing::trace!(aggregate = %self.aggregate_name(), id = %self.id, "instance disposed");
        }
    }

    /// Whether the record behind this handle is gone.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        !self.definition.registry().contains(self.key)
    }
}

impl<T: AggregateState> Instance<T> {
    /// Copy of the current state.
    pub fn state(&self) -> Result<T, RegistryError> {
        self.definition.registry().state(self.key)
    }

    /// Pop the pending events together with the state they leave behind.
    ///
    /// Later actions on this handle cannot leak into the returned state.
    pub(crate) fn pop_pending_with_state(&self) -> Result<(Vec<RecordedEvent>, T), RegistryError> {
        self.definition.registry().pop_pending_with_state(self.key)
    }

    /// Events recorded but not yet popped, oldest first.
    pub fn pending_events(&self) -> Result<Vec<RecordedEvent>, RegistryError> {
        self.definition
            .registry()
            .update(self.key, |record| record.pending_events.clone())
    }

    /// Run the action configured under `action`.
    ///
    /// # Errors
    ///
    /// Fails with [`ActionError::Instance`] once the handle is disposed,
    /// [`ActionError::UnknownAction`] for a name the definition does not
    /// configure, and otherwise with whatever the action returns.
    pub fn invoke(&self, action: &str, payload: Value) -> Result<(), ActionError> {
        if self.is_disposed() {
            return Err(RegistryError::InstanceDoesNotExist(self.key).into());
        }
        let Some(run) = self.definition.inner.actions.get(action) else {
            return Err(ActionError::UnknownAction {
                aggregate: self.aggregate_name().to_string(),
                action: action.to_string(),
            });
        };

        tracing::trace!(aggregate = %self.aggregate_name(), id = %self.id, action, "invoking action");
        run(&ActionContext { instance: self }, payload)
    }
}

impl<T> Drop for Instance<T> {
    fn drop(&mut self) {
        self.definition.registry().dispose(self.key);
    }
}

/// What an action sees of its instance.
pub struct ActionContext<'a, T> {
    instance: &'a Instance<T>,
}

impl<T: AggregateState> ActionContext<'_, T> {
    /// Copy of the current state. Later recordings do not change a copy that
    /// was already taken.
    pub fn state(&self) -> Result<T, RegistryError> {
        self.instance.state()
    }

    /// Version of the instance, counting events recorded so far.
    pub fn version(&self) -> Result<u64, RegistryError> {
        self.instance.version()
    }

    /// Identity of the instance the action runs against.
    #[must_use]
    pub fn id(&self) -> &str {
        self.instance.id()
    }

    /// Record `event` and apply its handler to the live state.
    ///
    /// An event without a registered handler is dropped: nothing is recorded
    /// and the state is unchanged.
    pub fn record_that(&self, event: &str, payload: impl Serialize) -> Result<(), ActionError> {
        let definition = &self.instance.definition;
        let Some(handler) = definition.event_handler(event) else {
            tracing::debug!(
                aggregate = %definition.name(),
                event,
                "no handler registered, event dropped"
            );
            return Ok(());
        };
        let payload = serde_json::to_value(payload)?;

        let version = definition
            .registry()
            .update(self.instance.key, |record| {
                handler(&mut record.state, &payload)?;
                Ok::<_, serde_json::Error>(record.push_event(event, payload))
            })??;
        tracing::trace!(aggregate = %definition.name(), event, version, "event recorded");
        Ok(())
    }

    /// Record a typed event under its [`DomainEvent::KIND`].
    pub fn record<E>(&self, event: &E) -> Result<(), ActionError>
    where
        E: DomainEvent + Serialize,
    {
        self.record_that(E::KIND, event)
    }
}
