//! Optimistic concurrency on aggregate streams.
//!
//! Every commit names the aggregate sequence it expects to occupy first. If
//! another writer got there before, the event log rejects the batch with a
//! [`ConcurrencyConflict`] and nothing from the batch is persisted.

use thiserror::Error;

use crate::identity::Identity;

/// Another writer appended to the stream since it was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(&self.aggregate_id, self.expected_start, self.actual_last))]
pub struct ConcurrencyConflict {
    pub aggregate_id: Identity,
    /// First sequence number the rejected batch tried to claim.
    pub expected_start: u64,
    /// Last sequence number already in the stream. `None` if it is empty.
    pub actual_last: Option<u64>,
}

impl ConcurrencyConflict {
    #[must_use]
    pub const fn new(
        aggregate_id: Identity,
        expected_start: u64,
        actual_last: Option<u64>,
    ) -> Self {
        Self {
            aggregate_id,
            expected_start,
            actual_last,
        }
    }
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(
    aggregate_id: &Identity,
    expected_start: u64,
    actual_last: Option<u64>,
) -> String {
    match actual_last {
        Some(last) if expected_start == 1 => format!(
            "concurrency conflict on `{aggregate_id}`: expected new stream, found sequence {last} \
             (hint: another process created this aggregate; reload and retry)"
        ),
        Some(last) => format!(
            "concurrency conflict on `{aggregate_id}`: expected to write sequence \
             {expected_start}, stream is at {last} (hint: stream was modified; reload and retry)"
        ),
        None => format!(
            "concurrency conflict on `{aggregate_id}`: expected to write sequence {expected_start} \
             but the stream is empty (hint: stream was deleted; reload and retry)"
        ),
    }
}
