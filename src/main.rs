//! `orm` CLI entry point.

use clap::Parser;
use orm::cli::commands;
use orm::cli::{Cli, Commands};
use orm::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet, cli.echo);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    // Run the command and handle errors
    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool, echo: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug,rusqlite=info",
            _ => "trace",
        };
        if echo && verbose < 3 {
            EnvFilter::new(format!("{base},orm::sql=info"))
        } else {
            EnvFilter::new(base)
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let database = cli.database.as_deref();
    match &cli.command {
        Commands::Demo { command } => commands::demo::execute(*command, database, cli.echo, json),
        Commands::Schema { apply } => commands::schema::execute(*apply, database, cli.echo, json),
        Commands::Version => commands::version::execute(json),
        Commands::Completions { shell } => commands::completions::execute(shell),
    }
}
