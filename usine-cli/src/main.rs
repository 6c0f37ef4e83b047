//! Usine — account reconciliation CLI.
//!
//! # Usage
//!
//! ```text
//! usine init [--data-dir <path>]
//! usine status [--json]
//! usine diff [--json]
//! usine reconcile <sync|create-defaults|cleanup|delete-all> [--dry-run] [--force] [--no-input] [--timeout <secs>] [--json]
//! usine provision <seed.yaml> [--dry-run]
//! ```
//!
//! Every command exits `0` when the stores are (or were left) consistent and
//! `1` otherwise.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use commands::{
    diff::DiffArgs, init::InitArgs, provision::ProvisionArgs, reconcile::ReconcileArgs,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "usine",
    version,
    about = "Keep the identity store and the profile store in step",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.usine/config.yaml and create the data directory.
    Init(InitArgs),

    /// Summarise both stores and whether they agree.
    Status(StatusArgs),

    /// List every record without a counterpart.
    Diff(DiffArgs),

    /// Run one reconciliation pass with the given policy.
    Reconcile(ReconcileArgs),

    /// Create accounts from a YAML seed file.
    Provision(ProvisionArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Reconcile(args) => args.run(),
        Commands::Provision(args) => args.run(),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
