//! Configuration management.
//!
//! Configuration is a single connection string naming the SQLite database,
//! plus the statement echo flag.
//!
//! Resolution priority for the connection string:
//! 1. Explicit value (the `--database` flag)
//! 2. `ORM_DATABASE_URL` environment variable
//! 3. Default: `sqlite:///:memory:`

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable consulted when no explicit URL is given.
pub const DATABASE_URL_ENV: &str = "ORM_DATABASE_URL";

/// Default connection string: a private in-memory database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///:memory:";

/// Where the backend connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// A private in-memory database, discarded when the connection closes.
    Memory,
    /// A database file.
    File(PathBuf),
}

impl ConnectionTarget {
    /// Parse a connection string.
    ///
    /// Accepted forms: `sqlite:///:memory:`, `sqlite::memory:`, `:memory:`,
    /// `sqlite:///<path>`, `sqlite://<path>`, or a bare file path.
    ///
    /// # Errors
    ///
    /// Returns `Config` for empty strings and non-SQLite schemes.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Config("connection string is empty".to_string()));
        }

        let rest = if let Some(rest) = url.strip_prefix("sqlite:") {
            rest.strip_prefix("///")
                .or_else(|| rest.strip_prefix("//"))
                .unwrap_or(rest)
        } else if let Some((scheme, _)) = url.split_once("://") {
            return Err(Error::Config(format!(
                "unsupported database scheme '{scheme}', only sqlite is available"
            )));
        } else {
            url
        };

        match rest {
            ":memory:" | "" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }

    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Connection string as given, for display.
    pub database_url: String,
    pub target: ConnectionTarget,
    /// Log generated SQL at `info`.
    pub echo: bool,
}

impl Config {
    /// Resolve configuration from an explicit URL (or the environment) and
    /// the echo flag.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the connection string cannot be parsed.
    pub fn resolve(explicit_url: Option<&str>, echo: bool) -> Result<Self> {
        let database_url = resolve_database_url(explicit_url);
        let target = ConnectionTarget::parse(&database_url)?;
        Ok(Self {
            database_url,
            target,
            echo,
        })
    }
}

/// Resolve the connection string.
///
/// Priority:
/// 1. If `explicit_url` is provided and non-blank, use it directly
/// 2. `ORM_DATABASE_URL` environment variable
/// 3. `sqlite:///:memory:`
#[must_use]
pub fn resolve_database_url(explicit_url: Option<&str>) -> String {
    // Priority 1: Explicit URL from CLI flag
    if let Some(url) = explicit_url.filter(|u| !u.trim().is_empty()) {
        return url.to_string();
    }

    // Priority 2: environment variable
    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        if !url.trim().is_empty() {
            return url;
        }
    }

    // Priority 3: in-memory default
    DEFAULT_DATABASE_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_forms() {
        for url in ["sqlite:///:memory:", "sqlite::memory:", ":memory:", "sqlite://"] {
            assert_eq!(ConnectionTarget::parse(url).unwrap(), ConnectionTarget::Memory, "{url}");
        }
    }

    #[test]
    fn test_parse_file_forms() {
        assert_eq!(
            ConnectionTarget::parse("sqlite:///tmp/app.db").unwrap(),
            ConnectionTarget::File(PathBuf::from("tmp/app.db"))
        );
        assert_eq!(
            ConnectionTarget::parse("sqlite:////tmp/app.db").unwrap(),
            ConnectionTarget::File(PathBuf::from("/tmp/app.db"))
        );
        assert_eq!(
            ConnectionTarget::parse("/var/data/app.db").unwrap(),
            ConnectionTarget::File(PathBuf::from("/var/data/app.db"))
        );
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(
            ConnectionTarget::parse("postgres://localhost/app"),
            Err(Error::Config(_))
        ));
        assert!(matches!(ConnectionTarget::parse("  "), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_database_url_with_explicit() {
        assert_eq!(resolve_database_url(Some("sqlite:///x.db")), "sqlite:///x.db");
    }

    #[test]
    fn test_config_resolve() {
        let config = Config::resolve(Some(":memory:"), true).unwrap();
        assert!(config.target.is_memory());
        assert!(config.echo);
        assert_eq!(config.database_url, ":memory:");
    }
}
