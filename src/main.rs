//! schema-sync CLI entry point.

use clap::Parser;
use schema_sync::cli::commands;
use schema_sync::cli::{Cli, Commands};
use schema_sync::error::Error;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    // Run the command and handle errors
    match run(&cli, json).await {
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

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

async fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let db = cli.db.as_deref();
    let dir = cli.dir.as_deref();
    let quiet = cli.quiet;

    match &cli.command {
        Commands::Install { force } => commands::install::execute(*force, db, dir, json, quiet),

        // Data
        Commands::Export => commands::sync::export(db, dir, json, quiet).await,
        Commands::Import { merge } => commands::sync::import(*merge, db, dir, json, quiet).await,
        Commands::Hash => commands::sync::hash(db, dir, json, quiet).await,
        Commands::Sync => commands::sync::sync(db, dir, json, quiet).await,
        Commands::ForceCommit => commands::sync::force_commit(db, dir, json, quiet).await,

        // Schema
        Commands::ExportSchema { split } => {
            commands::schema::export(*split, db, dir, json, quiet).await
        }
        Commands::ImportSchema => commands::schema::import(db, dir, json, quiet).await,

        Commands::Status => commands::status::execute(db, dir, json).await,
    }
}
