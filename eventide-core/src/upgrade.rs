//! Load-time event upgrading.
//!
//! Stored events are immutable. When an event's schema changes, keep the old
//! payload type in the aggregate's event set and register an upgrader that
//! rewrites old envelopes into new ones as the stream is loaded.

use crate::event::EventEnvelope;

/// Rewrites one loaded envelope into zero or more envelopes.
///
/// Upgraders should keep the envelope's position and metadata, usually via
/// [`EventEnvelope::with_event`].
pub trait EventUpgrader<E>: Send + Sync {
    fn upgrade(&self, envelope: EventEnvelope<E>) -> Vec<EventEnvelope<E>>;
}

impl<E, F> EventUpgrader<E> for F
where
    F: Fn(EventEnvelope<E>) -> Vec<EventEnvelope<E>> + Send + Sync,
{
    fn upgrade(&self, envelope: EventEnvelope<E>) -> Vec<EventEnvelope<E>> {
        self(envelope)
    }
}

/// Ordered chain of upgraders.
pub struct UpgradePipeline<E> {
    upgraders: Vec<Box<dyn EventUpgrader<E>>>,
}

impl<E> UpgradePipeline<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            upgraders: Vec::new(),
        }
    }

    pub fn push(&mut self, upgrader: impl EventUpgrader<E> + 'static) {
        self.upgraders.push(Box::new(upgrader));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upgraders.is_empty()
    }

    /// Run every envelope through each upgrader in registration order.
    ///
    /// Output order follows input order; the envelopes an upgrader emits for
    /// one input stay together at that input's position.
    #[must_use]
    pub fn upgrade(&self, envelopes: Vec<EventEnvelope<E>>) -> Vec<EventEnvelope<E>> {
        self.upgraders.iter().fold(envelopes, |current, upgrader| {
            current
                .into_iter()
                .flat_map(|envelope| upgrader.upgrade(envelope))
                .collect()
        })
    }
}

impl<E> Default for UpgradePipeline<E> {
    fn default() -> Self {
        Self::new()
    }
}
