//! Explicit column mapping for read models.
//!
//! Table-backed read model stores need to know which fields to persist and
//! how. A [`ReadModelSchema`] lists them once, with plain function pointers
//! to read and write each field, so no store ever has to inspect a type at
//! runtime.
//!
//! ```
//! use eventide_core::projection::{
//!     ReadModel,
//!     schema::{ColumnType, ColumnValue, ReadModelSchema, SchemaError},
//! };
//!
//! #[derive(Clone, Default)]
//! struct Balance {
//!     owner: String,
//!     cents: i64,
//! }
//!
//! impl ReadModel for Balance {
//!     const KIND: &'static str = "balance";
//! }
//!
//! let schema = ReadModelSchema::<Balance>::builder("balances")
//!     .column(
//!         "owner",
//!         ColumnType::Text,
//!         |b| ColumnValue::Text(b.owner.clone()),
//!         |b, v| {
//!             b.owner = v.into_text()?;
//!             Ok(())
//!         },
//!     )
//!     .column(
//!         "cents",
//!         ColumnType::BigInt,
//!         |b| ColumnValue::BigInt(b.cents),
//!         |b, v| {
//!             b.cents = v.into_big_int()?;
//!             Ok(())
//!         },
//!     )
//!     .build()?;
//!
//! assert_eq!(schema.table(), "balances");
//! assert_eq!(schema.column_names().collect::<Vec<_>>(), ["owner", "cents"]);
//! # Ok::<(), SchemaError>(())
//! ```

use std::{collections::HashSet, fmt};

use thiserror::Error;

use crate::projection::ReadModel;

/// Column names every read model table reserves for itself.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "version", "positions"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Boolean,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::BigInt => "bigint",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Json => "json",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Null,
    Text(String),
    BigInt(i64),
    Double(f64),
    Boolean(bool),
    Json(serde_json::Value),
}

impl ColumnValue {
    #[must_use]
    pub const fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Text(_) => Some(ColumnType::Text),
            Self::BigInt(_) => Some(ColumnType::BigInt),
            Self::Double(_) => Some(ColumnType::Double),
            Self::Boolean(_) => Some(ColumnType::Boolean),
            Self::Json(_) => Some(ColumnType::Json),
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::TypeMismatch`] unless the value is text.
    pub fn into_text(self) -> Result<String, SchemaError> {
        match self {
            Self::Text(v) => Ok(v),
            other => Err(SchemaError::mismatch(ColumnType::Text, &other)),
        }
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::TypeMismatch`] unless the value is a bigint.
    pub fn into_big_int(self) -> Result<i64, SchemaError> {
        match self {
            Self::BigInt(v) => Ok(v),
            other => Err(SchemaError::mismatch(ColumnType::BigInt, &other)),
        }
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::TypeMismatch`] unless the value is a double.
    pub fn into_double(self) -> Result<f64, SchemaError> {
        match self {
            Self::Double(v) => Ok(v),
            other => Err(SchemaError::mismatch(ColumnType::Double, &other)),
        }
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::TypeMismatch`] unless the value is a boolean.
    pub fn into_bool(self) -> Result<bool, SchemaError> {
        match self {
            Self::Boolean(v) => Ok(v),
            other => Err(SchemaError::mismatch(ColumnType::Boolean, &other)),
        }
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::TypeMismatch`] unless the value is JSON.
    pub fn into_json(self) -> Result<serde_json::Value, SchemaError> {
        match self {
            Self::Json(v) => Ok(v),
            other => Err(SchemaError::mismatch(ColumnType::Json, &other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("column name must not be empty")]
    EmptyName,
    #[error("column `{0}` declared twice")]
    DuplicateColumn(String),
    #[error("column name `{0}` is reserved")]
    ReservedColumn(String),
    #[error("schema for table `{0}` has no columns")]
    NoColumns(String),
    #[error("table name must not be empty")]
    EmptyTable,
    #[error("expected a {expected} value, found {found}")]
    TypeMismatch {
        expected: ColumnType,
        found: String,
    },
    #[error("column `{0}` missing from row")]
    MissingColumn(String),
}

impl SchemaError {
    fn mismatch(expected: ColumnType, found: &ColumnValue) -> Self {
        Self::TypeMismatch {
            expected,
            found: found
                .column_type()
                .map_or_else(|| "null".to_owned(), |t| t.to_string()),
        }
    }
}

pub type Getter<R> = fn(&R) -> ColumnValue;
pub type Setter<R> = fn(&mut R, ColumnValue) -> Result<(), SchemaError>;

pub struct Column<R> {
    name: &'static str,
    column_type: ColumnType,
    get: Getter<R>,
    set: Setter<R>,
}

impl<R> Column<R> {
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn column_type(&self) -> ColumnType {
        self.column_type
    }
}

impl<R> fmt::Debug for Column<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .finish_non_exhaustive()
    }
}

/// Validated column list for one read model type.
#[derive(Debug)]
pub struct ReadModelSchema<R> {
    table: String,
    columns: Vec<Column<R>>,
}

impl<R: ReadModel> ReadModelSchema<R> {
    #[must_use]
    pub fn builder(table: impl Into<String>) -> ReadModelSchemaBuilder<R> {
        ReadModelSchemaBuilder {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column<R>] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Read every column of `read_model`, in declaration order.
    #[must_use]
    pub fn extract(&self, read_model: &R) -> Vec<(&'static str, ColumnValue)> {
        self.columns
            .iter()
            .map(|c| (c.name, (c.get)(read_model)))
            .collect()
    }

    /// Build a read model from column values.
    ///
    /// Starts from `R::default()`; every declared column must be present.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] or the setter's error.
    pub fn hydrate<I, K>(&self, row: I) -> Result<R, SchemaError>
    where
        I: IntoIterator<Item = (K, ColumnValue)>,
        K: AsRef<str>,
    {
        let mut values: Vec<Option<ColumnValue>> = vec![None; self.columns.len()];
        for (name, value) in row {
            if let Some(slot) = self.columns.iter().position(|c| c.name == name.as_ref()) {
                values[slot] = Some(value);
            }
        }

        let mut read_model = R::default();
        for (column, value) in self.columns.iter().zip(values) {
            let value = value.ok_or_else(|| SchemaError::MissingColumn(column.name.to_owned()))?;
            (column.set)(&mut read_model, value)?;
        }
        Ok(read_model)
    }
}

pub struct ReadModelSchemaBuilder<R> {
    table: String,
    columns: Vec<Column<R>>,
}

impl<R: ReadModel> ReadModelSchemaBuilder<R> {
    #[must_use]
    pub fn column(
        mut self,
        name: &'static str,
        column_type: ColumnType,
        get: Getter<R>,
        set: Setter<R>,
    ) -> Self {
        self.columns.push(Column {
            name,
            column_type,
            get,
            set,
        });
        self
    }

    /// # Errors
    ///
    /// Rejects empty or reserved names, duplicates, and schemas without
    /// columns.
    pub fn build(self) -> Result<ReadModelSchema<R>, SchemaError> {
        if self.table.is_empty() {
            return Err(SchemaError::EmptyTable);
        }
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.table));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(SchemaError::EmptyName);
            }
            if RESERVED_COLUMNS.contains(&column.name) {
                return Err(SchemaError::ReservedColumn(column.name.to_owned()));
            }
            if !seen.insert(column.name) {
                return Err(SchemaError::DuplicateColumn(column.name.to_owned()));
            }
        }
        Ok(ReadModelSchema {
            table: self.table,
            columns: self.columns,
        })
    }
}

/// A read model that can be stored column by column.
pub trait SchemaReadModel: ReadModel {
    /// # Errors
    ///
    /// Returns the [`SchemaError`] found while validating the column list.
    fn schema() -> Result<ReadModelSchema<Self>, SchemaError>;
}
