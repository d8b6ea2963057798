//! Command implementations.

pub mod completions;
pub mod demo;
pub mod schema;
pub mod version;

use crate::config::Config;
use crate::error::Result;
use crate::storage::SqliteBackend;
use tracing::debug;

/// Resolve configuration and open the backend it names.
///
/// # Errors
///
/// Returns `Config` for unusable connection strings, or a database error if
/// the connection cannot be opened.
pub(crate) fn connect(database: Option<&str>, echo: bool) -> Result<(Config, SqliteBackend)> {
    let config = Config::resolve(database, echo)?;
    debug!(database = %config.database_url, echo = config.echo, "Connecting");
    let backend = SqliteBackend::connect(&config.target)?.with_echo(config.echo);
    Ok((config, backend))
}
