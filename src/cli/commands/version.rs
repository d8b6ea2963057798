//! Version command: crate, build profile and the linked SQLite library.

use crate::error::Result;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct VersionInfo {
    package: &'static str,
    version: &'static str,
    profile: &'static str,
    sqlite: &'static str,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            package: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            profile: if cfg!(debug_assertions) { "debug" } else { "release" },
            sqlite: rusqlite::version(),
        }
    }

    fn line(&self) -> String {
        format!(
            "{} {} ({} build, SQLite {})",
            self.package, self.version, self.profile, self.sqlite
        )
    }
}

/// Print version information.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let info = VersionInfo::current();
    if json {
        println!("{}", serde_json::to_string(&info)?);
    } else {
        println!("{}", info.line());
    }
    Ok(())
}
