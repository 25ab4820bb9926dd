//! gwd-nft - gateway nftables reconciler
//!
//! Converges the gateway's `inet` table (flowtable, LAN set, bypass sets and
//! base chains) to a JSON configuration, or tears it down.
//!
//! # Usage
//!
//! ```bash
//! gwd-nft defaults > gwd.json        # Print the default configuration
//! gwd-nft ensure --config gwd.json   # Create or repair the table
//! gwd-nft status --config gwd.json   # Show what is installed, as JSON
//! gwd-nft remove --config gwd.json   # Delete the table
//! ```
//!
//! Without `--config` the built-in defaults are used. Logging goes to stderr
//! and honours `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gwd_nft::config::load_config;
use gwd_nft::core::error::ErrorTranslation;
use gwd_nft::{Config, Error};

#[derive(Parser)]
#[command(name = "gwd-nft")]
#[command(about = "Reconciles the gateway nftables table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or repair the managed table
    Ensure {
        /// JSON configuration file (defaults when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Delete the managed table and everything in it
    Remove {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the installed objects as JSON
    Status {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as JSON
    Defaults,
}

fn config_from(path: Option<&Path>) -> Result<Config, Error> {
    match path {
        Some(path) => load_config(path),
        None => Ok(gwd_nft::default_config()),
    }
}

fn run(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Ensure { config } => {
            let cfg = config_from(config.as_deref())?;
            gwd_nft::ensure(&cfg)?;
            println!("✓ Table inet {} converged.", cfg.table_name);
        }
        Commands::Remove { config } => {
            let cfg = config_from(config.as_deref())?;
            gwd_nft::remove(&cfg)?;
            println!("✓ Table inet {} removed.", cfg.table_name);
        }
        Commands::Status { config } => {
            let cfg = config_from(config.as_deref())?;
            let status = gwd_nft::inspect(&cfg)?;
            let json = serde_json::to_string_pretty(&status)?;
            println!("{json}");
        }
        Commands::Defaults => {
            let json = serde_json::to_string_pretty(&gwd_nft::default_config())?;
            println!("{json}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let needs_kernel = !matches!(cli.command, Commands::Defaults);
    if needs_kernel && !nix::unistd::getuid().is_root() {
        eprintln!("Note: Not running as root. nf_tables changes need CAP_NET_ADMIN.");
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let translated = ErrorTranslation::from_error(&e);
            eprintln!("✗ {}", translated.user_message);
            for suggestion in &translated.suggestions {
                eprintln!("  - {suggestion}");
            }
            tracing::debug!("{e}");
            ExitCode::FAILURE
        }
    }
}
