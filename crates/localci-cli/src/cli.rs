//! Argument surface: the external CLI collaborator's inputs (`cwd`,
//! `job`/`jobs`, `needs`, `home`, `privileged`, `extraHosts`), plus the
//! supplemented `list`/`list-json` mode and shell completions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "localci")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more jobs (default: every job in the pipeline)
    Run(RunArgs),
    /// Print the compiled job table without executing anything
    List(ListArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Job names to run. Empty selects every job in the pipeline.
    pub jobs: Vec<String>,

    /// Directory holding the pipeline file. Defaults to the current directory.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Entry pipeline file, relative to `cwd`.
    #[arg(long, default_value = ".gitlab-ci.yml")]
    pub file: PathBuf,

    /// Pull in every transitive predecessor of the requested jobs.
    #[arg(long)]
    pub needs: bool,

    /// Home directory used for cache/include storage. Defaults to `dirs::home_dir()`.
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Run containerized jobs with `--privileged`.
    #[arg(long)]
    pub privileged: bool,

    /// Extra `host:ip` entries passed to every container.
    #[arg(long = "extra-host")]
    pub extra_hosts: Vec<String>,

    /// Maximum number of jobs running at once. Unbounded if unset.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Directory holding the pipeline file. Defaults to the current directory.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Entry pipeline file, relative to `cwd`.
    #[arg(long, default_value = ".gitlab-ci.yml")]
    pub file: PathBuf,

    /// Print machine-readable JSON instead of a text table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for (bash, zsh, fish, powershell)
    pub shell: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_job_names() {
        let cli = Cli::parse_from(["localci", "run", "compile", "unit-test"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.jobs, vec!["compile", "unit-test"]),
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn parses_run_with_needs_and_extra_hosts() {
        let cli = Cli::parse_from([
            "localci",
            "run",
            "unit-test",
            "--needs",
            "--extra-host",
            "registry.local:10.0.0.1",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.needs);
                assert_eq!(args.extra_hosts, vec!["registry.local:10.0.0.1".to_string()]);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn parses_list_json() {
        let cli = Cli::parse_from(["localci", "list", "--json"]);
        match cli.command {
            Commands::List(args) => assert!(args.json),
            other => panic!("expected List, got {other:?}"),
        }
    }

    #[test]
    fn parses_completions_shell() {
        let cli = Cli::parse_from(["localci", "completions", "zsh"]);
        match cli.command {
            Commands::Completions(args) => assert_eq!(args.shell, "zsh"),
            other => panic!("expected Completions, got {other:?}"),
        }
    }
}
