//! Storage backend contract and the SQLite implementation.
//!
//! The session never issues SQL itself. It talks to a [`StorageBackend`]:
//! - schema creation from mapped tables
//! - row insert / update / select / count
//! - nested transaction boundaries
//!
//! # Submodules
//!
//! - [`schema`] - DDL generation and existing-table verification
//! - [`sqlite`] - `rusqlite` backend

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::Result;
use crate::model::{Table, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Column values of one row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// A row read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: i64,
    pub values: Row,
}

/// Sort direction for [`Criteria::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Read criteria: equality filters on one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Criteria {
    pub table: String,
    /// `column = value` terms joined with AND. `Value::Null` matches `IS NULL`.
    pub filters: Vec<(String, Value)>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<u32>,
}

impl Criteria {
    /// Match every row of `table`, ordered by identity.
    #[must_use]
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn filter_by(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by.push((column.to_string(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Operations the session needs from a relational store.
///
/// Transactions nest: the outermost `begin_transaction` opens a real
/// transaction, inner calls open savepoints. Each `commit_transaction` or
/// `rollback_transaction` closes the innermost open level.
pub trait StorageBackend {
    /// Ensure the tables exist. Idempotent.
    ///
    /// # Errors
    ///
    /// `Schema` if an existing table conflicts with its mapping.
    fn execute_schema(&mut self, tables: &[Table]) -> Result<()>;

    /// Insert a row and return the identity assigned to it.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` on uniqueness, not-null or foreign-key violations.
    fn insert(&mut self, table: &str, row: &Row) -> Result<i64>;

    /// Write `row` over the existing row `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no row has this identity, `ConstraintViolation` as for insert.
    fn update(&mut self, table: &str, id: i64, row: &Row) -> Result<()>;

    /// Read rows matching `criteria`. Never mutates stored state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn select(&self, criteria: &Criteria) -> Result<Vec<Record>>;

    /// Count rows matching `criteria`, honoring its limit, without reading them.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn count(&self, criteria: &Criteria) -> Result<usize>;

    /// Open a transaction level.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start the transaction.
    fn begin_transaction(&mut self) -> Result<()>;

    /// Close the innermost level, keeping its writes.
    ///
    /// # Errors
    ///
    /// Returns an error if no level is open or the commit fails.
    fn commit_transaction(&mut self) -> Result<()>;

    /// Close the innermost level, discarding its writes.
    ///
    /// # Errors
    ///
    /// Returns an error if no level is open or the rollback fails.
    fn rollback_transaction(&mut self) -> Result<()>;
}
