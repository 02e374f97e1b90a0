//! # localci-cli
//!
//! Command-line entry point for localci: compiles a GitLab-CI pipeline
//! file, resolves the requested jobs against `localci-scheduler`, and runs
//! them through `localci-engine` against the real `docker` CLI.
//!
//! ## Usage
//!
//! ```bash
//! # Run every job in the pipeline
//! localci run
//!
//! # Run one job and everything it transitively needs
//! localci run unit-test --needs
//!
//! # Inspect the compiled job table without running anything
//! localci list
//!
//! # Generate shell completions
//! localci completions bash
//! ```

#![warn(unused)]

pub mod cli;
pub mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

/// Parses `argv` and dispatches to the matching subcommand. Returns whether
/// the run should be reported as a success to the shell (only meaningful
/// for `Commands::Run`; the other subcommands succeed whenever they don't
/// return an `Err`).
pub async fn run() -> Result<bool> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let outcome = commands::run_pipeline(args).await?;
            Ok(outcome.succeeded())
        }
        Commands::List(args) => {
            commands::list_jobs(args)?;
            Ok(true)
        }
        Commands::Completions(args) => {
            commands::generate_completions(args)?;
            Ok(true)
        }
    }
}
