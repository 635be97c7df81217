use eventide_core::{
    identity::Identity,
    metadata::Metadata,
    store::{CommittedEvent, EventPage, GlobalPosition, SequenceRange},
};
use sqlx::{Row, postgres::PgRow};

use super::Store;
use crate::{
    Error,
    error::{from_db, to_db},
};

const EVENT_COLUMNS: &str =
    "global_sequence, aggregate_id, aggregate_sequence, batch_id, data, metadata";

impl Store {
    pub(in crate::store) async fn load_stream(
        &self,
        aggregate_id: &Identity,
        range: SequenceRange,
    ) -> Result<Vec<CommittedEvent>, Error> {
        if range.to.is_some_and(|to| to < range.from) {
            return Ok(Vec::new());
        }
        let from = to_db(range.from)?;
        let to = range.to.map(to_db).transpose()?;

        let rows = sqlx::query(&format!(
            r"
            SELECT {EVENT_COLUMNS}
            FROM es_events
            WHERE aggregate_id = $1
              AND aggregate_sequence >= $2
              AND ($3::BIGINT IS NULL OR aggregate_sequence <= $3)
            ORDER BY aggregate_sequence ASC
            "
        ))
        .bind(aggregate_id.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        tracing::trace!(events = events.len(), "stream loaded");
        Ok(events)
    }

    pub(in crate::store) async fn load_page(
        &self,
        cursor: GlobalPosition,
        page_size: usize,
    ) -> Result<EventPage, Error> {
        if page_size == 0 {
            return Ok(EventPage::new(cursor, Vec::new()));
        }
        let limit = i64::try_from(page_size).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r"
            SELECT {EVENT_COLUMNS}
            FROM es_events
            WHERE global_sequence >= $1
            ORDER BY global_sequence ASC
            LIMIT $2
            "
        ))
        .bind(to_db(cursor.value())?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        Ok(EventPage::new(cursor, events))
    }
}

fn row_to_event(row: &PgRow) -> Result<CommittedEvent, Error> {
    let metadata: sqlx::types::Json<Metadata> = row.try_get("metadata")?;
    Ok(CommittedEvent {
        aggregate_id: Identity::new(row.try_get::<String, _>("aggregate_id")?),
        aggregate_sequence: from_db(row.try_get("aggregate_sequence")?)?,
        global_sequence: from_db(row.try_get("global_sequence")?)?,
        batch_id: row.try_get("batch_id")?,
        data: row.try_get("data")?,
        metadata: metadata.0,
    })
}
