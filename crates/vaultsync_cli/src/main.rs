//! VaultSync CLI
//!
//! Command-line tools for the VaultSync engine.
//!
//! # Commands
//!
//! - `simulate` - Run the two-device conflict scenario against an in-process relay
//! - `config` - Validate and print an engine configuration file

mod commands;
mod device;

use clap::{Parser, Subcommand};
use commands::simulate::Resolution;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// VaultSync command-line tools.
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two devices through a concurrent edit and resolve the conflict
    Simulate {
        /// How the second device resolves the conflict
        #[arg(short, long, value_enum, default_value = "keep-local")]
        resolve: Resolution,

        /// Engine configuration file (apiUrl, syncIntervalMs)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate and print an engine configuration file
    Config {
        /// Path to the JSON configuration
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
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
        Commands::Simulate {
            resolve,
            config,
            format,
        } => {
            commands::simulate::run(resolve, config.as_deref(), &format)?;
        }
        Commands::Config { file, format } => {
            commands::config::run(&file, &format)?;
        }
        Commands::Version => {
            println!("VaultSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("VaultSync Engine v{}", vaultsync_engine::VERSION);
        }
    }

    Ok(())
}
