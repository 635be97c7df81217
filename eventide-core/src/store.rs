//! Event log abstraction.
//!
//! The [`EventLog`] trait is the persistence boundary of the library: it
//! appends batches of serialized events under optimistic concurrency, loads
//! one aggregate's stream, pages through every stream in global order, and
//! deletes streams. [`inmemory::Store`] is the reference implementation.

use std::{fmt, future::Future, num::ParseIntError, str::FromStr};

pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    concurrency::ConcurrencyConflict, event::EventType, identity::Identity, metadata::Metadata,
};

pub mod inmemory;

/// Event ready to be appended: encoded payload plus fully stamped metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEvent {
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

/// An event as persisted by the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub aggregate_id: Identity,
    /// Position within the aggregate's stream. Starts at 1, gap-free.
    pub aggregate_sequence: u64,
    /// Position across every stream. Strictly increasing in commit order.
    pub global_sequence: u64,
    /// Shared by every event written in the same commit.
    pub batch_id: Uuid,
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

impl CommittedEvent {
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        self.metadata.event_type()
    }

    #[must_use]
    pub fn aggregate_name(&self) -> Option<&str> {
        self.metadata.aggregate_name()
    }
}

/// Inclusive range of aggregate sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl SequenceRange {
    /// Whole stream.
    pub const ALL: Self = Self { from: 1, to: None };

    #[must_use]
    pub const fn starting_at(from: u64) -> Self {
        Self { from, to: None }
    }

    #[must_use]
    pub const fn between(from: u64, to: u64) -> Self {
        Self { from, to: Some(to) }
    }

    #[must_use]
    pub const fn contains(&self, sequence: u64) -> bool {
        sequence >= self.from
            && match self.to {
                Some(to) => sequence <= to,
                None => true,
            }
    }
}

impl Default for SequenceRange {
    fn default() -> Self {
        Self::ALL
    }
}

/// Cursor into the global event order.
///
/// A position names the lowest global sequence a page read should return.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    pub const START: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position immediately following `global_sequence`.
    #[must_use]
    pub const fn after(global_sequence: u64) -> Self {
        Self(global_sequence.saturating_add(1))
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GlobalPosition {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// One page of the global event order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<CommittedEvent>,
    /// Where the next read should start. Equal to the requested cursor when
    /// the page is empty.
    pub next: GlobalPosition,
}

impl EventPage {
    /// Build a page from events read at `cursor`, ordered by global sequence.
    #[must_use]
    pub fn new(cursor: GlobalPosition, events: Vec<CommittedEvent>) -> Self {
        let next = events
            .last()
            .map_or(cursor, |event| GlobalPosition::after(event.global_sequence));
        Self { events, next }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Error from [`EventLog::commit_events`].
#[derive(Debug, Error)]
pub enum CommitError<StoreError>
where
    StoreError: std::error::Error,
{
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> CommitError<StoreError> {
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Convenience alias for commit outcomes returned by event logs.
pub type CommitOutcome<Err> = Result<Vec<CommittedEvent>, CommitError<Err>>;

/// Durable, ordered log of events grouped into per-aggregate streams.
///
/// Implementations must guarantee:
///
/// - a commit is all-or-nothing;
/// - aggregate sequences within a stream start at 1 and have no gaps;
/// - global sequences are unique and increase in commit order;
/// - two concurrent commits claiming the same aggregate sequence cannot both
///   succeed.
// ANCHOR: event_log_trait
pub trait EventLog: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a batch to one stream.
    ///
    /// The first event receives `expected_start_sequence`, the rest follow
    /// contiguously. Fails with [`CommitError::Conflict`] if the stream's last
    /// sequence is not `expected_start_sequence - 1`.
    fn commit_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        expected_start_sequence: u64,
        events: NonEmpty<SerializedEvent>,
    ) -> impl Future<Output = CommitOutcome<Self::Error>> + Send + 'a;

    /// Load one stream's events within `range`, ascending. A missing stream
    /// yields an empty vector.
    fn load_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        range: SequenceRange,
    ) -> impl Future<Output = Result<Vec<CommittedEvent>, Self::Error>> + Send + 'a;

    /// Load up to `page_size` events with global sequence at or after
    /// `cursor`, ascending.
    fn load_all_events_page(
        &self,
        cursor: GlobalPosition,
        page_size: usize,
    ) -> impl Future<Output = Result<EventPage, Self::Error>> + Send + '_;

    /// Remove a stream. Deleting a missing stream is not an error.
    fn delete_stream<'a>(
        &'a self,
        aggregate_id: &'a Identity,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
// ANCHOR_END: event_log_trait
