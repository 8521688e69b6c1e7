//! Before/after persist notifications.
//!
//! A save publishes the batch it is about to write on two channels. A
//! before-persist subscriber sits on the critical path: its failure aborts the
//! save. After-persist subscribers run once the events are durable; their
//! failures are logged and never reach the caller.

use std::{fmt, pin::Pin, sync::Arc};

use thiserror::Error;

use crate::store::StreamEvent;

/// Error type subscribers report failures with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type SubscriberFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type Subscriber = Arc<dyn Fn(Arc<[StreamEvent]>) -> SubscriberFuture + Send + Sync>;

/// When a subscriber is notified relative to the store append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Before the events are written. A failure aborts the save.
    BeforePersist,
    /// After the events are written. Failures are only logged.
    AfterPersist,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforePersist => "before-persist",
            Self::AfterPersist => "after-persist",
        })
    }
}

/// A subscriber failed while handling a notification.
#[derive(Debug, Error)]
#[error("{channel} subscriber #{index} failed: {source}")]
pub struct SubscriberError {
    /// Channel the subscriber was registered on.
    pub channel: Channel,
    /// Position of the subscriber in registration order.
    pub index: usize,
    /// Error the subscriber returned.
    #[source]
    pub source: BoxError,
}

/// Subscribers of both channels, notified in registration order.
#[derive(Clone, Default)]
pub struct Subscribers {
    before_persist: Vec<Subscriber>,
    after_persist: Vec<Subscriber>,
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("before_persist", &self.before_persist.len())
            .field("after_persist", &self.after_persist.len())
            .finish()
    }
}

impl Subscribers {
    /// No subscribers on either channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `subscriber` to `channel`.
    pub fn subscribe<F, Fut>(&mut self, channel: Channel, subscriber: F)
    where
        F: Fn(Arc<[StreamEvent]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let subscriber: Subscriber =
            Arc::new(move |events: Arc<[StreamEvent]>| -> SubscriberFuture {
                Box::pin(subscriber(events))
            });
        match channel {
            Channel::BeforePersist => self.before_persist.push(subscriber),
            Channel::AfterPersist => self.after_persist.push(subscriber),
        }
    }

    /// Number of subscribers on `channel`.
    #[must_use]
    pub fn count(&self, channel: Channel) -> usize {
        match channel {
            Channel::BeforePersist => self.before_persist.len(),
            Channel::AfterPersist => self.after_persist.len(),
        }
    }

    /// Notify before-persist subscribers one at a time, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the first subscriber failure.
    pub async fn publish_before(&self, events: &Arc<[StreamEvent]>) -> Result<(), SubscriberError> {
        for (index, subscriber) in self.before_persist.iter().enumerate() {
            subscriber(Arc::clone(events))
                .await
                .map_err(|source| SubscriberError {
                    channel: Channel::BeforePersist,
                    index,
                    source,
                })?;
        }
        Ok(())
    }

    /// Notify every after-persist subscriber. Failures are logged and do not
    /// stop later subscribers.
    pub async fn publish_after(&self, events: &Arc<[StreamEvent]>) {
        for (index, subscriber) in self.after_persist.iter().enumerate() {
            if let Err(error) = subscriber(Arc::clone(events)).await {
                tracing::warn!(
                    channel = %Channel::AfterPersist,
                    index,
                    error = %error,
                    "subscriber failed, events are already persisted"
                );
            }
        }
    }
}
