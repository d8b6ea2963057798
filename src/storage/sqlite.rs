//! SQLite storage backend.
//!
//! Implements [`StorageBackend`] on a single `rusqlite` connection. Nested
//! transaction levels map to savepoints; every generated statement is
//! logged on the `orm::sql` target (at `info` when echo is on, otherwise
//! at `trace`).

use crate::config::ConnectionTarget;
use crate::error::{Error, Result};
use crate::model::{Table, Value, PRIMARY_KEY};
use crate::storage::schema::{apply_schema, configure_connection};
use crate::storage::{Criteria, Record, Row, StorageBackend};
use crate::validate::validate_identifier;
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use std::cell::Cell;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
    depth: usize,
    echo: bool,
    stats: Cell<BackendStats>,
}

/// Counts of statements issued through a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Number of INSERT statements.
    pub inserts: usize,
    /// Number of UPDATE statements.
    pub updates: usize,
    /// Number of SELECT statements.
    pub selects: usize,
}

impl BackendStats {
    /// Returns total number of writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inserts + self.updates
    }
}

impl SqliteBackend {
    /// Open the database named by a connection target.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(target: &ConnectionTarget) -> Result<Self> {
        match target {
            ConnectionTarget::Memory => Self::open_memory(),
            ConnectionTarget::File(path) => Self::open(path),
        }
    }

    /// Open a database file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database file with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        debug!(path = %path.display(), "Opened SQLite database");
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        debug!("Opened in-memory SQLite database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure_connection(&conn)?;
        Ok(Self {
            conn,
            depth: 0,
            echo: false,
            stats: Cell::new(BackendStats::default()),
        })
    }

    /// Log every generated statement at `info` instead of `trace`.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Get a reference to the underlying connection.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Statements issued so far.
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        self.stats.get()
    }

    fn tally(&self, f: impl FnOnce(&mut BackendStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Number of open transaction levels.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    fn log_statement(&self, sql: &str, params: &[&Value]) {
        if self.echo {
            info!(target: "orm::sql", ?params, "{sql}");
        } else {
            trace!(target: "orm::sql", ?params, "{sql}");
        }
    }

    fn run(&self, sql: &str) -> Result<()> {
        self.log_statement(sql, &[]);
        self.conn.execute_batch(sql).map_err(classify)
    }
}

impl StorageBackend for SqliteBackend {
    fn execute_schema(&mut self, tables: &[Table]) -> Result<()> {
        for table in tables {
            self.log_statement(&crate::storage::schema::create_table_sql(table), &[]);
        }
        apply_schema(&self.conn, tables)
    }

    fn insert(&mut self, table: &str, row: &Row) -> Result<i64> {
        ident(table)?;
        for column in row.keys() {
            ident(column)?;
        }

        let sql = if row.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            let columns = row.keys().map(String::as_str).collect::<Vec<_>>().join(", ");
            let placeholders = (1..=row.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
            format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})")
        };

        let params: Vec<&Value> = row.values().collect();
        self.log_statement(&sql, &params);
        self.conn
            .execute(&sql, rusqlite::params_from_iter(params.iter()))
            .map_err(classify)?;
        self.tally(|s| s.inserts += 1);

        Ok(self.conn.last_insert_rowid())
    }

    fn update(&mut self, table: &str, id: i64, row: &Row) -> Result<()> {
        ident(table)?;
        for column in row.keys() {
            ident(column)?;
        }

        if row.is_empty() {
            let exists = self
                .conn
                .prepare(&format!("SELECT 1 FROM {table} WHERE {PRIMARY_KEY} = ?1"))?
                .exists([id])?;
            return if exists {
                Ok(())
            } else {
                Err(Error::NotFound { table: table.to_string(), id })
            };
        }

        let assignments = row
            .keys()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {table} SET {assignments} WHERE {PRIMARY_KEY} = ?{}",
            row.len() + 1
        );

        let id_value = Value::Integer(id);
        let mut params: Vec<&Value> = row.values().collect();
        params.push(&id_value);
        self.log_statement(&sql, &params);

        let changed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(params.iter()))
            .map_err(classify)?;
        self.tally(|s| s.updates += 1);

        if changed == 0 {
            return Err(Error::NotFound { table: table.to_string(), id });
        }
        Ok(())
    }

    fn select(&self, criteria: &Criteria) -> Result<Vec<Record>> {
        let (tail, params) = select_tail(criteria)?;
        let sql = format!("SELECT * {tail}");
        self.log_statement(&sql, &params);

        let mut stmt = self.conn.prepare(&sql).map_err(classify)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let records = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut id = 0;
                let mut values = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    if name == PRIMARY_KEY {
                        id = row.get(i)?;
                    } else {
                        values.insert(name.clone(), row.get::<_, Value>(i)?);
                    }
                }
                Ok(Record { id, values })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.tally(|s| s.selects += 1);
        Ok(records)
    }

    fn count(&self, criteria: &Criteria) -> Result<usize> {
        let (tail, params) = select_tail(criteria)?;
        let sql = format!("SELECT COUNT(*) FROM (SELECT {PRIMARY_KEY} {tail})");
        self.log_statement(&sql, &params);

        let count: i64 = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))
            .map_err(classify)?;
        self.tally(|s| s.selects += 1);
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            self.run("BEGIN IMMEDIATE")?;
        } else {
            self.run(&format!("SAVEPOINT sp_{}", self.depth))?;
        }
        self.depth += 1;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let level = self.open_level()?;
        if level == 0 {
            self.run("COMMIT")?;
        } else {
            self.run(&format!("RELEASE SAVEPOINT sp_{level}"))?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        let level = self.open_level()?;
        // The level is closed even if the statement fails: SQLite may already
        // have rolled the transaction back on its own.
        self.depth -= 1;
        if level == 0 {
            self.run("ROLLBACK")
        } else {
            self.run(&format!("ROLLBACK TO SAVEPOINT sp_{level}; RELEASE SAVEPOINT sp_{level}"))
        }
    }
}

impl SqliteBackend {
    fn open_level(&self) -> Result<usize> {
        self.depth
            .checked_sub(1)
            .ok_or_else(|| Error::InvalidArgument("no open transaction".to_string()))
    }
}

/// `FROM ... WHERE ... ORDER BY ... LIMIT ...` for `criteria`, with its
/// bound parameters.
fn select_tail(criteria: &Criteria) -> Result<(String, Vec<&Value>)> {
    ident(&criteria.table)?;

    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<&Value> = Vec::new();

    for (column, value) in &criteria.filters {
        ident(column)?;
        if value.is_null() {
            conditions.push(format!("{column} IS NULL"));
        } else {
            params.push(value);
            conditions.push(format!("{column} = ?{}", params.len()));
        }
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let mut order_terms = Vec::new();
    for (column, order) in &criteria.order_by {
        ident(column)?;
        order_terms.push(format!("{column} {}", order.as_sql()));
    }
    if order_terms.is_empty() {
        order_terms.push(format!("{PRIMARY_KEY} ASC"));
    }

    let limit_clause = criteria
        .limit
        .map(|n| format!(" LIMIT {n}"))
        .unwrap_or_default();

    let tail = format!(
        "FROM {}{where_clause} ORDER BY {}{limit_clause}",
        criteria.table,
        order_terms.join(", ")
    );
    Ok((tail, params))
}

fn ident(name: &str) -> Result<()> {
    validate_identifier(name).map_err(Error::InvalidArgument)
}

/// Map SQLite failures onto the backend error contract.
fn classify(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, ref message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::ConstraintViolation(message.clone().unwrap_or_else(|| failure.to_string()))
        }
        rusqlite::Error::SqliteFailure(_, Some(ref message))
            if message.starts_with("no such table") || message.contains("has no column named") =>
        {
            Error::Schema(message.clone())
        }
        other => Error::Database(other),
    }
}
