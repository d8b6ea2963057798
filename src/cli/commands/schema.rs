//! Schema command implementation.

use crate::cli::commands::connect;
use crate::error::Result;
use crate::storage::schema::schema_sql;
use crate::tutorial;
use serde::Serialize;

#[derive(Serialize)]
struct SchemaOutput {
    tables: Vec<String>,
    sql: String,
    /// Database the tables were created in, when applied.
    applied_to: Option<String>,
}

/// Print the tutorial DDL, optionally creating the tables.
///
/// # Errors
///
/// Returns configuration or schema errors when applying.
pub fn execute(apply: bool, database: Option<&str>, echo: bool, json: bool) -> Result<()> {
    let metadata = tutorial::metadata()?;
    let sql = schema_sql(metadata.tables());

    let applied_to = if apply {
        let (config, mut backend) = connect(database, echo)?;
        metadata.create_all(&mut backend)?;
        Some(config.database_url)
    } else {
        None
    };

    if json {
        let output = SchemaOutput {
            tables: metadata.tables().iter().map(|t| t.name.clone()).collect(),
            sql,
            applied_to,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{sql}");
    if let Some(database) = applied_to {
        println!();
        println!("Applied to {database}");
    }
    Ok(())
}
