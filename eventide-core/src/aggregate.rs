//! Aggregate engine.
//!
//! An [`Aggregate`] is plain domain state that folds events through
//! [`Aggregate::apply`]. [`AggregateRoot`] wraps that state with the
//! bookkeeping the repository needs: the stream identity, the version, the
//! buffer of emitted-but-uncommitted events, and the source ids of every
//! commit already applied.

use std::collections::HashSet;

use crate::{
    event::{EventEnvelope, EventSet},
    identity::{Identity, SourceId},
    metadata::Metadata,
    store::CommittedEvent,
};

/// Domain state rebuilt from events.
// ANCHOR: aggregate_trait
pub trait Aggregate: Default + Send + Sync + 'static {
    /// Aggregate type name, stamped into metadata as `aggregate_name`.
    ///
    /// Use lowercase, kebab-case: `"account"`, `"order-saga"`.
    const KIND: &'static str;

    type Event: EventSet + Clone + std::fmt::Debug;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fold one event into the state.
    ///
    /// Must be deterministic and infallible: it runs both when an event is
    /// emitted and every time the stream is replayed.
    fn apply(&mut self, event: &Self::Event);
}
// ANCHOR_END: aggregate_trait

/// Per-event state transition.
///
/// Lets [`Aggregate::apply`] stay a thin `match` that dispatches each
/// variant to its own impl.
///
/// ```ignore
/// impl Apply<FundsDeposited> for Account {
///     fn apply(&mut self, event: &FundsDeposited) {
///         self.balance += event.amount;
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Typed command handling.
///
/// An alternative to writing a mutation closure by hand: the handler
/// validates the command against current state and returns the events to
/// emit. See [`Repository::execute`](crate::repository::Repository::execute).
pub trait Handle<C>: Aggregate {
    /// # Errors
    ///
    /// Returns `Self::Error` if the command is invalid for the current state.
    fn handle(&self, command: &C) -> Result<Vec<Self::Event>, Self::Error>;
}

/// An emitted event waiting to be committed.
#[derive(Clone, Debug, PartialEq)]
pub struct UncommittedEvent<E> {
    pub event: E,
    pub metadata: Metadata,
}

/// Aggregate state plus stream bookkeeping.
pub struct AggregateRoot<A: Aggregate> {
    id: Identity,
    version: u64,
    state: A,
    uncommitted: Vec<UncommittedEvent<A::Event>>,
    source_ids: HashSet<SourceId>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh root with no history.
    #[must_use]
    pub fn new(id: Identity) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
            source_ids: HashSet::new(),
        }
    }

    /// Rebuild a root by applying committed envelopes in order.
    #[must_use]
    pub fn replay<'e>(
        id: Identity,
        envelopes: impl IntoIterator<Item = &'e EventEnvelope<A::Event>>,
    ) -> Self {
        let mut root = Self::new(id);
        for envelope in envelopes {
            root.apply_committed(envelope);
        }
        root
    }

    pub const fn id(&self) -> &Identity {
        &self.id
    }

    /// Sequence of the newest event in the stream, counting uncommitted
    /// events.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Version as of the last load, ignoring uncommitted events.
    #[must_use]
    pub fn committed_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    /// True while no event has ever been applied.
    pub const fn is_new(&self) -> bool {
        self.version == 0
    }

    pub const fn state(&self) -> &A {
        &self.state
    }

    #[must_use]
    pub fn into_state(self) -> A {
        self.state
    }

    pub fn uncommitted_events(&self) -> &[UncommittedEvent<A::Event>] {
        &self.uncommitted
    }

    #[must_use]
    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// True if a commit made under `source_id` has been applied.
    #[must_use]
    pub fn has_seen_source(&self, source_id: &SourceId) -> bool {
        self.source_ids.contains(source_id)
    }

    /// Record a new event: apply it now, commit it later.
    pub fn emit(&mut self, event: impl Into<A::Event>) {
        self.emit_with_metadata(event, Metadata::new());
    }

    /// Like [`emit`](Self::emit), with extra metadata for this event only.
    pub fn emit_with_metadata(&mut self, event: impl Into<A::Event>, metadata: Metadata) {
        let event = event.into();
        self.state.apply(&event);
        self.version += 1;
        tracing::trace!(
            aggregate = A::KIND,
            aggregate_id = %self.id,
            event_type = %event.event_type(),
            version = self.version,
            "event emitted"
        );
        self.uncommitted.push(UncommittedEvent { event, metadata });
    }

    /// Apply an event read from the log.
    ///
    /// The version follows the envelope's aggregate sequence, so an upgrader
    /// that splits one stored event into several does not shift later
    /// sequences.
    pub fn apply_committed(&mut self, envelope: &EventEnvelope<A::Event>) {
        self.state.apply(&envelope.event);
        self.version = self.version.max(envelope.aggregate_sequence);
        if let Some(source_id) = envelope.metadata.source_id() {
            self.source_ids.insert(source_id);
        }
    }

    /// Account for the stored events behind the envelopes that were
    /// replayed.
    ///
    /// Upgraders may drop events. The next commit must still start after the
    /// stream's real head, and the source ids of dropped events must still
    /// deduplicate.
    pub fn observe_stored(&mut self, stored: &[CommittedEvent]) {
        if let Some(last) = stored.last() {
            self.version = self.version.max(last.aggregate_sequence);
        }
        self.source_ids
            .extend(stored.iter().filter_map(|event| event.metadata.source_id()));
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<UncommittedEvent<A::Event>> {
        std::mem::take(&mut self.uncommitted)
    }
}

impl<A> std::fmt::Debug for AggregateRoot<A>
where
    A: Aggregate + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("kind", &A::KIND)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("uncommitted", &self.uncommitted.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{event::DomainEvent, metadata::keys};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Added {
        amount: i64,
    }

    impl DomainEvent for Added {
        const NAME: &'static str = "added";
    }

    crate::event_set! {
        #[derive(Clone, Debug, PartialEq, Eq)]
        enum CounterEvent {
            Added(Added),
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        total: i64,
        applied: usize,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter error")]
    struct CounterError;

    impl Aggregate for Counter {
        const KIND: &'static str = "counter";
        type Event = CounterEvent;
        type Error = CounterError;

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Added(e) => Apply::apply(self, e),
            }
        }
    }

    impl Apply<Added> for Counter {
        fn apply(&mut self, event: &Added) {
            self.total += event.amount;
            self.applied += 1;
        }
    }

    fn envelope(sequence: u64, amount: i64, source: &str) -> EventEnvelope<CounterEvent> {
        EventEnvelope {
            aggregate_id: Identity::new("c-1"),
            aggregate_sequence: sequence,
            global_sequence: sequence,
            event: Added { amount }.into(),
            metadata: Metadata::new().with(keys::SOURCE_ID, source),
        }
    }

    #[test]
    fn new_root_is_new() {
        let root = AggregateRoot::<Counter>::new(Identity::new("c-1"));
        assert!(root.is_new());
        assert_eq!(root.version(), 0);
        assert!(!root.has_uncommitted());
    }

    #[test]
    fn emit_applies_and_buffers() {
        let mut root = AggregateRoot::<Counter>::new(Identity::new("c-1"));
        root.emit(Added { amount: 2 });
        root.emit(Added { amount: 3 });

        assert_eq!(root.state().total, 5);
        assert_eq!(root.version(), 2);
        assert_eq!(root.committed_version(), 0);
        assert_eq!(root.uncommitted_events().len(), 2);
        assert!(!root.is_new());
    }

    #[test]
    fn replay_is_deterministic_and_tracks_sources() {
        let history = vec![envelope(1, 4, "s1"), envelope(2, -1, "s2")];
        let a = AggregateRoot::<Counter>::replay(Identity::new("c-1"), &history);
        let b = AggregateRoot::<Counter>::replay(Identity::new("c-1"), &history);

        assert_eq!(a.state().total, b.state().total);
        assert_eq!(a.state().total, 3);
        assert_eq!(a.version(), 2);
        assert_eq!(a.committed_version(), 2);
        assert!(a.has_seen_source(&SourceId::new("s1")));
        assert!(!a.has_seen_source(&SourceId::new("s3")));
    }

    #[test]
    fn split_upgrades_do_not_advance_version_twice() {
        let history = vec![envelope(1, 1, "s1"), envelope(1, 1, "s1"), envelope(2, 1, "s2")];
        let root = AggregateRoot::<Counter>::replay(Identity::new("c-1"), &history);
        assert_eq!(root.state().applied, 3);
        assert_eq!(root.version(), 2);
    }

    #[test]
    fn stored_head_wins_over_dropped_upgrades() {
        let history = vec![envelope(1, 4, "s1")];
        let mut root = AggregateRoot::<Counter>::replay(Identity::new("c-1"), &history);
        let stored: Vec<_> = [(1, "s1"), (2, "s2")]
            .into_iter()
            .map(|(sequence, source)| CommittedEvent {
                aggregate_id: Identity::new("c-1"),
                aggregate_sequence: sequence,
                global_sequence: sequence,
                batch_id: uuid::Uuid::nil(),
                data: Vec::new(),
                metadata: Metadata::new().with(keys::SOURCE_ID, source),
            })
            .collect();

        root.observe_stored(&stored);
        assert_eq!(root.version(), 2);
        assert_eq!(root.committed_version(), 2);
        assert_eq!(root.state().total, 4);
        assert!(root.has_seen_source(&SourceId::new("s2")));
    }

    #[test]
    fn take_uncommitted_drains_buffer() {
        let mut root = AggregateRoot::<Counter>::new(Identity::new("c-1"));
        root.emit(Added { amount: 1 });
        let taken = root.take_uncommitted();
        assert_eq!(taken.len(), 1);
        assert!(!root.has_uncommitted());
    }
}
