use eventide_core::projection::schema::SchemaError;

/// Error type for `PostgreSQL` event log, ack log and read model operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A sequence or position does not fit the column type.
    #[error("sequence value out of range: {0}")]
    SequenceOutOfRange(i128),
    /// Aggregate sequences start at 1.
    #[error("expected start sequence must be at least 1")]
    InvalidStartSequence,
    /// Insert operation returned no sequences for written events.
    #[error("database did not return inserted sequences")]
    MissingReturnedSequence,
    /// Event metadata could not be encoded or decoded as JSON.
    #[error("metadata encoding error: {0}")]
    Metadata(#[source] serde_json::Error),
    /// A stored row does not match the read model schema.
    #[error("read model schema error: {0}")]
    Schema(#[from] SchemaError),
}

pub(crate) fn to_db(value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::SequenceOutOfRange(i128::from(value)))
}

pub(crate) fn from_db(value: i64) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| Error::SequenceOutOfRange(i128::from(value)))
}
