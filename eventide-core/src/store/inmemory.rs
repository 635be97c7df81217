//! In-memory event log for tests and single-process use.
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! let log = inmemory::Store::new();
//! let shared = log.clone(); // clones share the same streams
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use nonempty::NonEmpty;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    concurrency::ConcurrencyConflict,
    identity::Identity,
    store::{
        CommitError, CommitOutcome, CommittedEvent, EventLog, EventPage, GlobalPosition,
        SequenceRange, SerializedEvent,
    },
};

/// In-memory event log.
///
/// Streams index into a single global map ordered by global sequence, so
/// paging the whole log is a range scan. Global sequences start at 1 and are
/// never reused, even after a stream is deleted.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Global sequences of each stream's events, in aggregate order.
    streams: HashMap<Identity, Vec<u64>>,
    events: BTreeMap<u64, CommittedEvent>,
    last_global: u64,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all streams.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Error type for the in-memory log.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("aggregate sequences start at 1, got {0}")]
    InvalidStartSequence(u64),
}

impl EventLog for Store {
    type Error = InMemoryError;

    #[tracing::instrument(
        skip(self, aggregate_id, events),
        fields(aggregate_id = %aggregate_id, event_count = events.len())
    )]
    async fn commit_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        expected_start_sequence: u64,
        events: NonEmpty<SerializedEvent>,
    ) -> CommitOutcome<Self::Error> {
        if expected_start_sequence == 0 {
            return Err(CommitError::store(InMemoryError::InvalidStartSequence(0)));
        }

        let mut inner = self.inner.lock().await;
        let last = inner
            .streams
            .get(aggregate_id)
            .map_or(0, |stream| stream.len() as u64);

        if expected_start_sequence != last + 1 {
            tracing::debug!(expected_start_sequence, last, "concurrency conflict");
            return Err(ConcurrencyConflict::new(
                aggregate_id.clone(),
                expected_start_sequence,
                (last > 0).then_some(last),
            )
            .into());
        }

        let batch_id = Uuid::new_v4();
        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            inner.last_global += 1;
            committed.push(CommittedEvent {
                aggregate_id: aggregate_id.clone(),
                aggregate_sequence: expected_start_sequence + offset as u64,
                global_sequence: inner.last_global,
                batch_id,
                data: event.data,
                metadata: event.metadata,
            });
        }

        let Inner {
            streams, events, ..
        } = &mut *inner;
        let stream = streams.entry(aggregate_id.clone()).or_default();
        for event in &committed {
            stream.push(event.global_sequence);
            events.insert(event.global_sequence, event.clone());
        }

        tracing::debug!(
            first_global = committed.first().map(|e| e.global_sequence),
            "events committed"
        );
        Ok(committed)
    }

    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    async fn load_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        range: SequenceRange,
    ) -> Result<Vec<CommittedEvent>, Self::Error> {
        let inner = self.inner.lock().await;
        let Some(stream) = inner.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };
        let events: Vec<CommittedEvent> = stream
            .iter()
            .filter_map(|global| inner.events.get(global))
            .filter(|event| range.contains(event.aggregate_sequence))
            .cloned()
            .collect();
        tracing::trace!(count = events.len(), "loaded stream");
        Ok(events)
    }

    #[tracing::instrument(skip(self))]
    async fn load_all_events_page(
        &self,
        cursor: GlobalPosition,
        page_size: usize,
    ) -> Result<EventPage, Self::Error> {
        let inner = self.inner.lock().await;
        let events = inner
            .events
            .range(cursor.value()..)
            .take(page_size)
            .map(|(_, event)| event.clone())
            .collect();
        Ok(EventPage::new(cursor, events))
    }

    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    async fn delete_stream<'a>(&'a self, aggregate_id: &'a Identity) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if let Some(stream) = inner.streams.remove(aggregate_id) {
            for global in stream {
                inner.events.remove(&global);
            }
            tracing::debug!("stream deleted");
        }
        Ok(())
    }
}
