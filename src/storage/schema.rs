//! Schema generation from mapped tables.
//!
//! Every table gets an implicit `id INTEGER PRIMARY KEY`. Creation is
//! idempotent: tables that already exist are verified against their
//! mapping instead of being recreated.

use crate::error::{Error, Result};
use crate::model::{Table, PRIMARY_KEY};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use tracing::{debug, info};

/// Generate the `CREATE TABLE` statement for one mapped table.
#[must_use]
pub fn create_table_sql(table: &Table) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {PRIMARY_KEY} INTEGER PRIMARY KEY",
        table.name
    );

    for column in &table.columns {
        let _ = write!(sql, ",\n    {} {}", column.name, column.kind.sql_name());
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if column.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(target) = &column.references {
            let _ = write!(sql, " REFERENCES {target}({PRIMARY_KEY})");
        }
    }

    sql.push_str("\n);");
    sql
}

/// Generate the full DDL script for `tables`, in order.
#[must_use]
pub fn schema_sql(tables: &[Table]) -> String {
    tables
        .iter()
        .map(create_table_sql)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Set connection pragmas required by the mapping layer.
///
/// # Errors
///
/// Returns an error if a pragma cannot be set.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Create missing tables and verify existing ones.
///
/// # Errors
///
/// Returns `Schema` if an existing table conflicts with its mapping, or a
/// database error if DDL execution fails.
pub fn apply_schema(conn: &Connection, tables: &[Table]) -> Result<()> {
    for table in tables {
        if table_exists(conn, &table.name)? {
            verify_table(conn, table)?;
            debug!(table = %table.name, "Table exists, structure verified");
            continue;
        }

        conn.execute_batch(&create_table_sql(table))?;
        info!(table = %table.name, columns = table.columns.len() + 1, "Created table");
    }
    Ok(())
}

/// Check if a table exists.
///
/// # Errors
///
/// Returns an error if the catalog query fails.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists([table])?)
}

/// Compare a stored table with its mapping: same column names, types,
/// nullability, single-column uniqueness and foreign-key targets.
fn verify_table(conn: &Connection, table: &Table) -> Result<()> {
    // (name, type, notnull, pk)
    let stored: Vec<(String, String, bool, bool)> = conn
        .prepare(&format!("SELECT name, type, \"notnull\", pk FROM pragma_table_info('{}')", table.name))?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get::<_, i64>(3)? > 0)))?
        .collect::<std::result::Result<_, _>>()?;

    let conflict = |detail: String| Error::Schema(format!("table '{}' conflicts with its mapping: {detail}", table.name));

    match stored.iter().find(|(name, ..)| name == PRIMARY_KEY) {
        Some((_, kind, _, true)) if kind.eq_ignore_ascii_case("INTEGER") => {}
        _ => return Err(conflict(format!("'{PRIMARY_KEY}' is not an INTEGER PRIMARY KEY"))),
    }

    for column in &table.columns {
        let Some((_, kind, not_null, _)) = stored.iter().find(|(name, ..)| *name == column.name) else {
            return Err(conflict(format!("missing column '{}'", column.name)));
        };
        if !kind.eq_ignore_ascii_case(column.kind.sql_name()) {
            return Err(conflict(format!(
                "column '{}' is {kind}, mapped as {}",
                column.name,
                column.kind.sql_name()
            )));
        }
        if *not_null == column.nullable {
            return Err(conflict(format!(
                "column '{}' nullability differs from its mapping",
                column.name
            )));
        }
    }

    if let Some((extra, ..)) = stored
        .iter()
        .find(|(name, ..)| name != PRIMARY_KEY && table.get_column(name).is_none())
    {
        return Err(conflict(format!("unmapped column '{extra}'")));
    }

    let unique = unique_columns(conn, &table.name)?;
    let references = foreign_keys(conn, &table.name)?;
    for column in &table.columns {
        if unique.contains(&column.name) != column.unique {
            return Err(conflict(format!(
                "column '{}' uniqueness differs from its mapping",
                column.name
            )));
        }
        match (&column.references, references.get(&column.name)) {
            (None, None) => {}
            (Some(mapped), Some(stored)) if mapped.eq_ignore_ascii_case(stored) => {}
            (mapped, stored) => {
                return Err(conflict(format!(
                    "column '{}' references {}, mapped to {}",
                    column.name,
                    stored.map_or("nothing", String::as_str),
                    mapped.as_deref().unwrap_or("nothing")
                )));
            }
        }
    }

    Ok(())
}

/// Columns covered on their own by a unique index or constraint.
fn unique_columns(conn: &Connection, table: &str) -> Result<BTreeSet<String>> {
    let indexes: Vec<String> = conn
        .prepare("SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND origin != 'pk'")?
        .query_map([table], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut unique = BTreeSet::new();
    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
    for index in indexes {
        let columns: Vec<String> = info
            .query_map([&index], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        if let [column] = columns.as_slice() {
            unique.insert(column.clone());
        }
    }
    Ok(unique)
}

/// Foreign-key column to referenced table.
fn foreign_keys(conn: &Connection, table: &str) -> Result<BTreeMap<String, String>> {
    Ok(conn
        .prepare("SELECT \"from\", \"table\" FROM pragma_foreign_key_list(?1)")?
        .query_map([table], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?)
}
