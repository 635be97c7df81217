mod commit;
mod load;

use eventide_core::{
    identity::Identity,
    store::{
        CommitOutcome, CommittedEvent, EventLog, EventPage, GlobalPosition, SequenceRange,
        SerializedEvent,
    },
};
use nonempty::NonEmpty;
use sqlx::PgPool;

use crate::Error;

/// A PostgreSQL-backed [`EventLog`].
///
/// - Global sequences come from a `BIGSERIAL` column. Every commit holds a
///   transaction-scoped advisory lock on [`Store::COMMIT_LOCK_KEY`], so
///   sequences become visible in the order they were assigned and a page
///   read never passes over a lower sequence that is still in flight.
/// - `UNIQUE (aggregate_id, aggregate_sequence)` makes two writers claiming
///   the same sequence collide; the loser gets a concurrency conflict.
/// - Payloads are stored as `bytea`, metadata as `jsonb`.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    /// Advisory lock key serializing commits to `es_events`.
    pub const COMMIT_LOCK_KEY: i64 = 0x6576_656e_7469_6465;

    /// Construct a `PostgreSQL` event log from a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_events (
                global_sequence    BIGSERIAL PRIMARY KEY,
                aggregate_id       TEXT NOT NULL,
                aggregate_sequence BIGINT NOT NULL,
                batch_id           UUID NOT NULL,
                data               BYTEA NOT NULL,
                metadata           JSONB NOT NULL,
                created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (aggregate_id, aggregate_sequence)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl EventLog for Store {
    type Error = Error;

    #[tracing::instrument(
        skip(self, events),
        fields(aggregate_id = %aggregate_id, events_len = events.len())
    )]
    async fn commit_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        expected_start_sequence: u64,
        events: NonEmpty<SerializedEvent>,
    ) -> CommitOutcome<Self::Error> {
        self.commit_batch(aggregate_id, expected_start_sequence, events)
            .await
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        range: SequenceRange,
    ) -> Result<Vec<CommittedEvent>, Self::Error> {
        self.load_stream(aggregate_id, range).await
    }

    #[tracing::instrument(skip(self), fields(cursor = %cursor))]
    async fn load_all_events_page(
        &self,
        cursor: GlobalPosition,
        page_size: usize,
    ) -> Result<EventPage, Self::Error> {
        self.load_page(cursor, page_size).await
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn delete_stream<'a>(&'a self, aggregate_id: &'a Identity) -> Result<(), Self::Error> {
        let deleted = sqlx::query("DELETE FROM es_events WHERE aggregate_id = $1")
            .bind(aggregate_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::debug!(deleted, "stream deleted");
        Ok(())
    }
}
