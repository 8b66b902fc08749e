//! replidx CLI
//!
//! Command-line harness for replidx sync targets.
//!
//! # Commands
//!
//! - `replay` - Replay a JSON-lines change feed into a snapshot index
//! - `watermarks` - Display or reset stored watermarks

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// replidx command-line tools.
#[derive(Parser)]
#[command(name = "replidx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the watermark file
    #[arg(global = true, short, long)]
    watermarks: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a change feed as one sync pass
    Replay {
        /// JSON-lines change feed to replay
        #[arg(short, long)]
        feed: PathBuf,

        /// JSON snapshot of the materialized index
        #[arg(short, long)]
        index: PathBuf,

        /// Source instance the feed was read from
        #[arg(long)]
        instance: String,

        /// Selection criteria to record for the next pass
        #[arg(long)]
        formula: Option<String>,

        /// Rebuild the index from this feed alone
        #[arg(long)]
        wipe: bool,
    },

    /// Display stored watermarks
    Watermarks {
        /// Drop the watermark of this instance first
        #[arg(long)]
        forget: Option<String>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replay {
            feed,
            index,
            instance,
            formula,
            wipe,
        } => {
            let watermarks = cli.watermarks.ok_or("Watermark path required for replay")?;
            let options = commands::replay::ReplayOptions {
                instance,
                formula,
                wipe,
            };
            commands::replay::run(&feed, &index, &watermarks, &options)?;
        }
        Commands::Watermarks { forget, format } => {
            let watermarks = cli
                .watermarks
                .ok_or("Watermark path required for watermarks")?;
            commands::watermarks::run(&watermarks, forget.as_deref(), &format)?;
        }
        Commands::Version => {
            println!("replidx CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
