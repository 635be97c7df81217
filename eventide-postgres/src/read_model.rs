//! Read model tables driven by a [`ReadModelSchema`].
//!
//! Each read model type gets its own table: an `id` primary key, a `version`
//! column used for optimistic writes, a `positions` column holding the last
//! applied sequence per source aggregate, and one nullable column per schema
//! entry.

use std::fmt;

use eventide_core::projection::{
    ReadModel, ReadModelEnvelope, ReadModelStore, StreamPositions, WriteError,
    schema::{Column, ColumnType, ColumnValue, ReadModelSchema, SchemaError, SchemaReadModel},
};
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgRow},
    query::Query,
    types::Json,
};

use crate::{
    Error,
    error::{from_db, to_db},
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// A [`ReadModelStore`] persisting `R` into the table its schema names.
pub struct ReadModelTable<R> {
    pool: PgPool,
    schema: ReadModelSchema<R>,
    statements: Statements,
}

impl<R: ReadModel> fmt::Debug for ReadModelTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadModelTable")
            .field("table", &self.schema.table())
            .finish_non_exhaustive()
    }
}

impl<R: SchemaReadModel> ReadModelTable<R> {
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if `R`'s schema is invalid.
    pub fn new(pool: PgPool) -> Result<Self, Error> {
        let schema = R::schema()?;
        let statements = Statements::new(&schema);
        Ok(Self {
            pool,
            schema,
            statements,
        })
    }

    pub fn schema(&self) -> &ReadModelSchema<R> {
        &self.schema
    }

    /// Create the table if it does not exist.
    ///
    /// Existing tables are left alone; columns added to the schema later need
    /// a manual migration.
    #[tracing::instrument(skip(self), fields(table = self.schema.table()))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&self.statements.create)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn bind_columns<'q>(
        &self,
        mut query: PgQuery<'q>,
        read_model: &R,
    ) -> Result<PgQuery<'q>, Error> {
        let values = self.schema.extract(read_model);
        for (column, (_, value)) in self.schema.columns().iter().zip(values) {
            query = bind_value(query, column, value)?;
        }
        Ok(query)
    }

    async fn current_version(&self, id: &str) -> Result<Option<u64>, Error> {
        let version: Option<i64> = sqlx::query_scalar(&self.statements.version)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        version.map(from_db).transpose()
    }
}

impl<R: SchemaReadModel> ReadModelStore<R> for ReadModelTable<R> {
    type Error = Error;

    async fn get<'a>(&'a self, id: &'a str) -> Result<ReadModelEnvelope<R>, Self::Error> {
        let Some(row) = sqlx::query(&self.statements.select)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(ReadModelEnvelope::empty(id));
        };

        let version = from_db(row.try_get("version")?)?;
        let Json(positions): Json<StreamPositions> = row.try_get("positions")?;
        if positions.version() != version {
            tracing::warn!(
                id,
                version,
                positions = positions.version(),
                "stored version disagrees with stored positions"
            );
        }
        let values = self
            .schema
            .columns()
            .iter()
            .map(|column| -> Result<_, Error> {
                Ok((column.name(), decode_value(&row, column)?))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let read_model = self.schema.hydrate(values)?;

        Ok(ReadModelEnvelope {
            id: id.to_owned(),
            read_model: Some(read_model),
            version: Some(version),
            positions,
        })
    }

    #[tracing::instrument(skip(self, read_model), fields(table = self.schema.table()))]
    async fn put<'a>(
        &'a self,
        id: &'a str,
        read_model: R,
        positions: StreamPositions,
        expected_version: Option<u64>,
    ) -> Result<(), WriteError<Self::Error>> {
        let sql = match expected_version {
            None => &self.statements.insert,
            Some(_) => &self.statements.update,
        };
        let query = sqlx::query(sql)
            .bind(id)
            .bind(to_db(positions.version()).map_err(WriteError::Store)?)
            .bind(Json(positions));
        let mut query = self
            .bind_columns(query, &read_model)
            .map_err(WriteError::Store)?;
        if let Some(expected) = expected_version {
            query = query.bind(to_db(expected).map_err(WriteError::Store)?);
        }

        let written = query
            .execute(&self.pool)
            .await
            .map_err(|e| WriteError::Store(Error::Database(e)))?
            .rows_affected();
        if written == 1 {
            return Ok(());
        }

        let actual = self
            .current_version(id)
            .await
            .map_err(WriteError::Store)?;
        tracing::debug!(actual = ?actual, "read model write lost a race");
        Err(WriteError::Stale {
            id: id.to_owned(),
            expected: expected_version,
            actual,
        })
    }

    async fn delete<'a>(&'a self, id: &'a str) -> Result<(), Self::Error> {
        sqlx::query(&self.statements.delete)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(table = self.schema.table()))]
    async fn delete_all(&self) -> Result<(), Self::Error> {
        let deleted = sqlx::query(&self.statements.delete_all)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::debug!(deleted, "read model table cleared");
        Ok(())
    }
}

/// SQL rendered once per table.
#[derive(Debug)]
struct Statements {
    create: String,
    select: String,
    version: String,
    insert: String,
    update: String,
    delete: String,
    delete_all: String,
}

impl Statements {
    fn new<R: ReadModel>(schema: &ReadModelSchema<R>) -> Self {
        let table = quote_ident(schema.table());
        let columns: Vec<String> = schema
            .columns()
            .iter()
            .map(|c| quote_ident(c.name()))
            .collect();

        let definitions = schema
            .columns()
            .iter()
            .zip(&columns)
            .map(|(column, name)| format!(",\n    {name} {} NULL", sql_type(column.column_type())))
            .collect::<String>();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    \"id\" TEXT PRIMARY KEY,\n    \
             \"version\" BIGINT NOT NULL,\n    \"positions\" JSONB NOT NULL{definitions}\n)"
        );

        let select = format!(
            "SELECT \"version\", \"positions\", {} FROM {table} WHERE \"id\" = $1",
            columns.join(", ")
        );
        let version = format!("SELECT \"version\" FROM {table} WHERE \"id\" = $1");

        // Bind order for both writes: id, version, positions, then the schema
        // columns.
        let placeholders = (4..4 + columns.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>();
        let insert = format!(
            "INSERT INTO {table} (\"id\", \"version\", \"positions\", {}) VALUES ($1, $2, $3, {}) \
             ON CONFLICT (\"id\") DO NOTHING",
            columns.join(", "),
            placeholders.join(", ")
        );
        let assignments = columns
            .iter()
            .zip(&placeholders)
            .map(|(c, p)| format!(", {c} = {p}"))
            .collect::<String>();
        let update = format!(
            "UPDATE {table} SET \"version\" = $2, \"positions\" = $3{assignments} \
             WHERE \"id\" = $1 AND \"version\" = ${}",
            columns.len() + 4
        );

        Self {
            create,
            select,
            version,
            insert,
            update,
            delete: format!("DELETE FROM {table} WHERE \"id\" = $1"),
            delete_all: format!("DELETE FROM {table}"),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::BigInt => "BIGINT",
        ColumnType::Double => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Json => "JSONB",
    }
}

/// Bind `value`, typing NULLs by the column so Postgres can infer them.
fn bind_value<'q, R>(
    query: PgQuery<'q>,
    column: &Column<R>,
    value: ColumnValue,
) -> Result<PgQuery<'q>, Error> {
    if let Some(found) = value.column_type()
        && found != column.column_type()
    {
        return Err(Error::Schema(SchemaError::TypeMismatch {
            expected: column.column_type(),
            found: found.to_string(),
        }));
    }

    Ok(match (column.column_type(), value) {
        (_, ColumnValue::Text(v)) => query.bind(v),
        (_, ColumnValue::BigInt(v)) => query.bind(v),
        (_, ColumnValue::Double(v)) => query.bind(v),
        (_, ColumnValue::Boolean(v)) => query.bind(v),
        (_, ColumnValue::Json(v)) => query.bind(v),
        (ColumnType::Text, ColumnValue::Null) => query.bind(None::<String>),
        (ColumnType::BigInt, ColumnValue::Null) => query.bind(None::<i64>),
        (ColumnType::Double, ColumnValue::Null) => query.bind(None::<f64>),
        (ColumnType::Boolean, ColumnValue::Null) => query.bind(None::<bool>),
        (ColumnType::Json, ColumnValue::Null) => query.bind(None::<serde_json::Value>),
    })
}

fn decode_value<R>(row: &PgRow, column: &Column<R>) -> Result<ColumnValue, sqlx::Error> {
    let name = column.name();
    Ok(match column.column_type() {
        ColumnType::Text => row
            .try_get::<Option<String>, _>(name)?
            .map_or(ColumnValue::Null, ColumnValue::Text),
        ColumnType::BigInt => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(ColumnValue::Null, ColumnValue::BigInt),
        ColumnType::Double => row
            .try_get::<Option<f64>, _>(name)?
            .map_or(ColumnValue::Null, ColumnValue::Double),
        ColumnType::Boolean => row
            .try_get::<Option<bool>, _>(name)?
            .map_or(ColumnValue::Null, ColumnValue::Boolean),
        ColumnType::Json => row
            .try_get::<Option<serde_json::Value>, _>(name)?
            .map_or(ColumnValue::Null, ColumnValue::Json),
    })
}
