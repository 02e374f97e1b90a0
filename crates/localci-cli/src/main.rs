//! localci - a local executor for GitLab CI pipelines
//!
//! ## Commands
//!
//! - `localci run [jobs...]` - compile and execute the named jobs (or every
//!   job, if none are named)
//! - `localci list` - print the compiled job table without running anything
//! - `localci completions <shell>` - generate shell completions
//!
//! ## Quick start
//!
//! ```bash
//! # Run every job
//! localci run
//!
//! # Run one job and its transitive predecessors
//! localci run unit-test --needs
//! ```

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var("LOCALCI_DEBUG").is_ok() {
        tracing_subscriber::fmt::init();
    }

    match localci_cli::run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            if std::env::var("LOCALCI_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
