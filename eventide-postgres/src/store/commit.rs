use eventide_core::{
    concurrency::ConcurrencyConflict,
    identity::Identity,
    store::{CommitError, CommitOutcome, CommittedEvent, SerializedEvent},
};
use nonempty::NonEmpty;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::Store;
use crate::{
    Error,
    error::{from_db, to_db},
};

impl Store {
    /// Insert a batch in one transaction.
    ///
    /// Commits are serialized by an advisory lock held until the transaction
    /// ends, which keeps global sequence assignment in commit order.
    ///
    /// The stream's current last sequence is checked first so that a stale
    /// start sequence is reported without touching the table; the unique
    /// constraint catches the writer that raced past that check.
    pub(in crate::store) async fn commit_batch(
        &self,
        aggregate_id: &Identity,
        expected_start: u64,
        events: NonEmpty<SerializedEvent>,
    ) -> CommitOutcome<Error> {
        if expected_start == 0 {
            return Err(CommitError::Store(Error::InvalidStartSequence));
        }
        let prepared = Self::prepare_events(expected_start, &events).map_err(CommitError::Store)?;
        let batch_id = Uuid::new_v4();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CommitError::Store(Error::Database(e)))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(Self::COMMIT_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| CommitError::Store(Error::Database(e)))?;

        let last: Option<i64> = sqlx::query_scalar(
            r"SELECT MAX(aggregate_sequence) FROM es_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CommitError::Store(Error::Database(e)))?;
        let last = last.map(from_db).transpose().map_err(CommitError::Store)?;

        if last.unwrap_or(0) + 1 != expected_start {
            return Err(CommitError::Conflict(ConcurrencyConflict::new(
                aggregate_id.clone(),
                expected_start,
                last,
            )));
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO es_events (aggregate_id, aggregate_sequence, batch_id, data, metadata) ",
        );
        qb.push_values(prepared, |mut b, (sequence, data, metadata)| {
            b.push_bind(aggregate_id.as_str());
            b.push_bind(sequence);
            b.push_bind(batch_id);
            b.push_bind(data);
            b.push_bind(metadata);
        });
        qb.push(" RETURNING global_sequence, aggregate_sequence");

        let rows = match qb.build().fetch_all(&mut *tx).await {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::debug!("unique violation on commit, reporting conflict");
                return Err(CommitError::Conflict(ConcurrencyConflict::new(
                    aggregate_id.clone(),
                    expected_start,
                    last,
                )));
            }
            Err(e) => return Err(CommitError::Store(Error::Database(e))),
        };
        if rows.len() != events.len() {
            return Err(CommitError::Store(Error::MissingReturnedSequence));
        }

        let mut assigned = Vec::with_capacity(rows.len());
        for row in &rows {
            let global: i64 = row
                .try_get("global_sequence")
                .map_err(|e| CommitError::Store(Error::Database(e)))?;
            let sequence: i64 = row
                .try_get("aggregate_sequence")
                .map_err(|e| CommitError::Store(Error::Database(e)))?;
            assigned.push((
                from_db(sequence).map_err(CommitError::Store)?,
                from_db(global).map_err(CommitError::Store)?,
            ));
        }
        assigned.sort_unstable();

        tx.commit().await.map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => CommitError::Conflict(
                ConcurrencyConflict::new(aggregate_id.clone(), expected_start, last),
            ),
            e => CommitError::Store(Error::Database(e)),
        })?;

        let committed = events
            .into_iter()
            .zip(assigned)
            .map(|(event, (aggregate_sequence, global_sequence))| CommittedEvent {
                aggregate_id: aggregate_id.clone(),
                aggregate_sequence,
                global_sequence,
                batch_id,
                data: event.data,
                metadata: event.metadata,
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            first_global = committed.first().map(|e| e.global_sequence),
            "batch committed"
        );
        Ok(committed)
    }

    /// Pair each event with its target sequence and JSON metadata.
    pub(in crate::store) fn prepare_events(
        expected_start: u64,
        events: &NonEmpty<SerializedEvent>,
    ) -> Result<Vec<(i64, Vec<u8>, serde_json::Value)>, Error> {
        let mut prepared = Vec::with_capacity(events.len());
        for (offset, event) in (0u64..).zip(events.iter()) {
            let sequence = to_db(expected_start + offset)?;
            let metadata = serde_json::to_value(&event.metadata).map_err(Error::Metadata)?;
            prepared.push((sequence, event.data.clone(), metadata));
        }
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use eventide_core::metadata::Metadata;

    use super::*;

    fn event(payload: &str) -> SerializedEvent {
        SerializedEvent {
            data: payload.as_bytes().to_vec(),
            metadata: Metadata::new().with("event_name", "noted"),
        }
    }

    #[test]
    fn prepare_events_assigns_contiguous_sequences_in_order() {
        let batch = NonEmpty::from((event("a"), vec![event("b"), event("c")]));
        let prepared = Store::prepare_events(4, &batch).unwrap();

        let sequences: Vec<i64> = prepared.iter().map(|(s, _, _)| *s).collect();
        assert_eq!(sequences, vec![4, 5, 6]);
        assert_eq!(prepared[1].1, b"b".to_vec());
        assert_eq!(prepared[0].2, serde_json::json!({ "event_name": "noted" }));
    }

    #[test]
    fn prepare_events_rejects_sequences_beyond_bigint() {
        let err = Store::prepare_events(u64::MAX, &NonEmpty::new(event("a"))).unwrap_err();
        assert!(matches!(err, Error::SequenceOutOfRange(_)));
    }
}
