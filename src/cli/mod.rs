//! CLI definitions using clap.

use clap::{Parser, Subcommand};

pub mod commands;

/// Unit-of-work ORM session over SQLite
#[derive(Parser, Debug)]
#[command(name = "orm", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database connection string (default: $ORM_DATABASE_URL, else sqlite:///:memory:)
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Log every generated SQL statement
    #[arg(long, global = true, env = "ORM_ECHO")]
    pub echo: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a tutorial scenario through a session
    Demo {
        #[command(subcommand)]
        command: DemoCommands,
    },

    /// Print the DDL of the tutorial mapping
    Schema {
        /// Also create the tables in the configured database
        #[arg(long)]
        apply: bool,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoCommands {
    /// Insert a user, query it back, add more users, rename and commit
    Basic,

    /// Insert a user with two addresses through cascade, then load them back
    Relations,
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}
