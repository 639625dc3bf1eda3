//! tidesync CLI
//!
//! Command-line tools for tidesync client stores.
//!
//! # Commands
//!
//! - `inspect` - Display records, outbox entries and session state
//! - `compact` - Rewrite a journal as a single snapshot frame
//! - `simulate` - Run an offline/online sync scenario against an in-memory server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidesync_engine::EngineConfig;
use tracing_subscriber::EnvFilter;

/// tidesync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display records, outbox entries and session state
    Inspect {
        /// Include payload bytes in the output
        #[arg(long)]
        payloads: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite the journal as a single snapshot frame
    Compact {
        /// Dry run - show sizes without rewriting
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Queue writes offline, reconnect and drain them against an in-memory server
    Simulate {
        /// Number of records to create while offline
        #[arg(short, long, default_value = "10")]
        records: usize,

        /// Transient server failures to inject after reconnecting
        #[arg(long, default_value = "0")]
        failures: usize,

        /// Responses to drop after the server applied the write
        #[arg(long, default_value = "0")]
        lost: usize,

        /// Revoke the access token before reconnecting
        #[arg(long)]
        revoke: bool,

        /// Entries claimed per sync cycle
        #[arg(long, default_value = "32")]
        batch_size: usize,

        /// Concurrent requests per cycle
        #[arg(long, default_value = "4")]
        max_in_flight: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { payloads, format } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, payloads, &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Journal path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Simulate {
            records,
            failures,
            lost,
            revoke,
            batch_size,
            max_in_flight,
            format,
        } => {
            let options = commands::simulate::Options {
                records,
                failures,
                lost,
                revoke,
                journal: cli.path,
                config: EngineConfig::default()
                    .with_batch_size(batch_size)
                    .with_max_in_flight(max_in_flight),
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Version => {
            println!("tidesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
