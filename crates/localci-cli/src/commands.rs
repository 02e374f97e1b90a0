//! Ties the compiler, scheduler, and engine together for each subcommand.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use localci_core::compiler::{Compiler, ProcessFetcher, TemplateLibrary};
use localci_core::job::is_template;
use localci_core::{git, state};
use localci_engine::{ConsoleSink, JobEngine, JobEngineConfig};
use localci_runtime::docker::DockerRuntime;
use localci_scheduler::{PipelineOutcome, PipelineRunner, SchedulerConfig};

use crate::cli::{CompletionsArgs, ListArgs, RunArgs};

fn resolve_cwd(cwd: &Option<PathBuf>) -> Result<PathBuf> {
    match cwd {
        Some(path) => Ok(path.clone()),
        None => std::env::current_dir().context("failed to read current directory"),
    }
}

fn compile(cwd: &Path, file: &Path, pipeline_iid: u64) -> Result<localci_core::PipelineConfig> {
    let gitlab_ci_local_dir = cwd.join(".gitlab-ci-local");
    let git_info = git::probe(cwd).context("failed to read git metadata — is this a git repository?")?;

    let fetcher = ProcessFetcher { cache_dir: gitlab_ci_local_dir.join("includes") };
    let templates = TemplateLibrary::empty();
    let compiler = Compiler::new(cwd.to_path_buf(), &fetcher, &templates);

    compiler
        .compile(file, &git_info, pipeline_iid)
        .with_context(|| format!("failed to compile pipeline `{}`", file.display()))
}

/// Compiles the pipeline, dispatches the requested jobs, and returns the
/// final per-job outcome. The caller decides the process exit code from
/// [`PipelineOutcome::succeeded`].
pub async fn run_pipeline(args: RunArgs) -> Result<PipelineOutcome> {
    let cwd = resolve_cwd(&args.cwd)?;
    let gitlab_ci_local_dir = cwd.join(".gitlab-ci-local");

    let pipeline_iid =
        state::next_pipeline_iid(&gitlab_ci_local_dir).context("failed to persist pipeline iid")?;
    let pipeline = compile(&cwd, &args.file, pipeline_iid)?;

    let requested: BTreeSet<String> = if args.jobs.is_empty() {
        pipeline.jobs.keys().filter(|name| !is_template(name)).cloned().collect()
    } else {
        args.jobs.iter().cloned().collect()
    };

    let home_dir = args
        .home
        .clone()
        .or_else(dirs::home_dir)
        .context("could not determine a home directory; pass --home explicitly")?;

    let engine_config = JobEngineConfig {
        project_dir: cwd.clone(),
        gitlab_ci_local_dir: gitlab_ci_local_dir.clone(),
        home_dir,
        extra_hosts: args.extra_hosts.clone(),
        privileged: args.privileged,
    };

    let runtime = DockerRuntime::new(cwd.clone());
    let name_width = pipeline.jobs.keys().map(String::len).max().unwrap_or(10) + 1;
    let sink = ConsoleSink::create(&gitlab_ci_local_dir.join("output/console.log"), name_width)
        .context("failed to open console log")?;

    let engine = JobEngine::new(&runtime, &sink, &engine_config);
    let base_scope = pipeline.global_variables.clone();
    let artifacts_dir_for = |name: &str| engine_config.artifacts_dir(name);
    let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

    let scheduler_config =
        SchedulerConfig { requested, expand_needs: args.needs, concurrency: args.concurrency };

    let outcome = runner.run(&pipeline, &scheduler_config).await.context("scheduler failed")?;

    for (name, state) in &outcome.states {
        tracing::info!(job = %name, state = ?state, "job finished");
    }

    Ok(outcome)
}

/// Prints the compiled job table without running anything.
pub fn list_jobs(args: ListArgs) -> Result<()> {
    let cwd = resolve_cwd(&args.cwd)?;
    let pipeline = compile(&cwd, &args.file, 0)?;

    if args.json {
        let rows: Vec<serde_json::Value> = pipeline
            .jobs
            .values()
            .filter(|job| !is_template(&job.name))
            .map(|job| {
                serde_json::json!({
                    "name": job.name,
                    "stage": job.stage,
                    "when": format!("{:?}", job.when),
                    "allowFailure": job.allow_failure,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for job in pipeline.jobs.values().filter(|job| !is_template(&job.name)) {
            println!("{:<30} {:<10} {:?}", job.name, job.stage, job.when);
        }
    }

    Ok(())
}

/// Writes shell completions for `shell` to stdout.
pub fn generate_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::Shell;

    let shell = match args.shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        other => anyhow::bail!("unsupported shell: {other}"),
    };

    let mut cmd = crate::cli::Cli::command();
    clap_complete::generate(shell, &mut cmd, "localci", &mut std::io::stdout());
    Ok(())
}
