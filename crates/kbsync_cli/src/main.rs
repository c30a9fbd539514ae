//! kbsync CLI
//!
//! Command-line client for the kbsync engine.
//!
//! # Commands
//!
//! - `init` - Write a default configuration file
//! - `device-id` - Print (and create if needed) this device's id
//! - `keygen` - Generate a master key file
//! - `sync` - Run one sync session
//! - `status` - Show pending changes and remote lock state
//! - `watch` - Run the scheduler until interrupted

mod commands;
mod context;
mod file_store;

use clap::{Parser, Subcommand};
use context::Context;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// kbsync multi-device sync client.
#[derive(Parser)]
#[command(name = "kbsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(global = true, short, long, default_value = "kbsync.toml")]
    config: PathBuf,

    /// Directory holding the device id and the local item store
    #[arg(global = true, short, long, default_value = ".kbsync")]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print this device's id
    DeviceId,

    /// Generate a base64 master key
    Keygen {
        /// Key file to write
        #[arg(short, long)]
        out: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run one sync session
    Sync {
        /// Re-upload everything and replay the whole remote change log
        #[arg(long)]
        full: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show pending changes and remote state
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sync periodically until Ctrl-C
    Watch,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let context = Context::new(cli.config, cli.data_dir);

    match cli.command {
        Commands::Init { force } => commands::init::run(&context, force)?,
        Commands::DeviceId => commands::device::run(&context)?,
        Commands::Keygen { out, force } => commands::keygen::run(&out, force)?,
        Commands::Sync { full, format } => commands::sync::run(&context, full, &format)?,
        Commands::Status { format } => commands::status::run(&context, &format)?,
        Commands::Watch => commands::watch::run(&context)?,
    }

    Ok(())
}
