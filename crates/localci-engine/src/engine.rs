//! The per-job state machine: workspace prepare, container create, script
//! execution, artifact extraction, coverage scan, and guaranteed cleanup.
//!
//! [`JobEngine::run`] never returns without having attempted cleanup —
//! every branch, including early errors, falls through to it.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;

use localci_core::job::{is_template, Job};
use localci_core::variables::Scope;
use localci_core::{safe_name, JobRun, RunState};
use localci_runtime::Runtime;

use crate::artifacts;
use crate::cache_lock::CacheLocks;
use crate::container;
use crate::coverage;
use crate::script;
use crate::sink::Sink;
use crate::watchdog::{SilenceWatchdog, DEFAULT_SILENCE_WINDOW};
use crate::workspace;

/// Paths under `.gitlab-ci-local/` the engine reads and writes.
pub struct JobEngineConfig {
    pub project_dir: PathBuf,
    pub gitlab_ci_local_dir: PathBuf,
    /// Host home directory backing the shared cache, so caches survive a
    /// throwaway `project_dir` checkout. Defaults to the real `$HOME`.
    pub home_dir: PathBuf,
    pub extra_hosts: Vec<String>,
    pub privileged: bool,
}

impl JobEngineConfig {
    #[must_use]
    pub fn builds_dir(&self, job_name: &str) -> PathBuf {
        self.gitlab_ci_local_dir.join("builds").join(safe_name(job_name))
    }

    #[must_use]
    pub fn artifacts_dir(&self, job_name: &str) -> PathBuf {
        self.gitlab_ci_local_dir.join("artifacts").join(safe_name(job_name))
    }

    #[must_use]
    pub fn log_path(&self, job_name: &str) -> PathBuf {
        self.gitlab_ci_local_dir.join("output").join(format!("{}.log", safe_name(job_name)))
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join(".gitlab-ci-local").join("cache")
    }
}

/// Ties the workspace/container/script/artifact/coverage building blocks
/// into one job's run. Holds only borrowed collaborators — all mutable
/// state lives on the [`JobRun`] it returns.
pub struct JobEngine<'a> {
    runtime: &'a dyn Runtime,
    sink: &'a dyn Sink,
    config: &'a JobEngineConfig,
    /// Per-cache-key advisory locks, shared across every job this engine
    /// runs so concurrent jobs sharing a `cache.key` never race on the
    /// same host directory.
    cache_locks: CacheLocks,
}

impl<'a> JobEngine<'a> {
    #[must_use]
    pub fn new(runtime: &'a dyn Runtime, sink: &'a dyn Sink, config: &'a JobEngineConfig) -> Self {
        Self { runtime, sink, config, cache_locks: CacheLocks::new() }
    }

    /// Runs one job to completion. Always returns — failures are recorded
    /// on the returned [`JobRun`] rather than propagated, since the
    /// scheduler needs a terminal state for every job it dispatches.
    pub async fn run(&self, job: &Job, job_id: u64, scope: &Scope, input_artifact_dirs: &[PathBuf]) -> JobRun {
        assert!(!is_template(&job.name), "templates are never scheduled");

        let mut run = JobRun::new(job_id);
        run.state = RunState::Running;
        run.started_at = Some(SystemTime::now());

        let log_path = self.config.log_path(&job.name);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::File::create(&log_path);

        // Held for the job's whole lifecycle (execute + cleanup), not just
        // the container-create step that reads the cache bind — the cache
        // directory stays in use until the container using it is removed.
        let cache_key = job.image.as_ref().and_then(|_| container::cache_key(&job.cache));
        let _cache_guard = match &cache_key {
            Some(key) => Some(self.cache_locks.acquire(key).await),
            None => None,
        };

        let outcome = self.execute(job, &mut run, scope, input_artifact_dirs, &log_path).await;

        self.cleanup(&mut run).await;

        match outcome {
            Ok(()) => self.finalize_state(job, &mut run),
            Err(message) => {
                tracing::error!(job = %job.name, error = %message, "job execution error");
                run.state = RunState::Failed;
            }
        }

        run
    }

    async fn execute(
        &self,
        job: &Job,
        run: &mut JobRun,
        scope: &Scope,
        input_artifact_dirs: &[PathBuf],
        log_path: &Path,
    ) -> Result<(), String> {
        let env: BTreeMap<String, String> = scope.as_env_map();
        let build_dir = self.config.builds_dir(&job.name);

        let container_id = if let Some(image) = &job.image {
            let spec = container::build_spec(
                job,
                run.job_id,
                image,
                &env,
                &self.config.cache_dir(),
                &self.config.extra_hosts,
                self.config.privileged,
            );
            run.volume_name = Some(spec.volume_name.clone());
            let id = container::create(self.runtime, &spec).await.map_err(|e| e.to_string())?;
            run.container_id = Some(id.clone());

            for dir in input_artifact_dirs {
                let _ = self.runtime.copy_into(&id, dir, Path::new("/builds")).await;
            }
            Some(id)
        } else {
            workspace::prepare_shell_workspace(&self.config.project_dir, &build_dir).map_err(|e| e.to_string())?;
            for dir in input_artifact_dirs {
                let _ = copy_dir_merge(dir, &build_dir);
            }
            None
        };

        let prescript_lines: Vec<String> =
            job.before_scripts.iter().chain(job.scripts.iter()).cloned().collect();

        let prescript_exit = self
            .run_script_phase(job, &container_id, &build_dir, &env, &prescript_lines, log_path)
            .await?;
        run.prescript_exit_code = Some(prescript_exit);
        if prescript_exit != 0 && job.allow_failure {
            self.sink.line(&job.name, true, &format!("WARN {prescript_exit} (allow_failure)"));
        }

        if !job.after_scripts.is_empty() {
            let afterscript_exit = self
                .run_script_phase(job, &container_id, &build_dir, &env, &job.after_scripts, log_path)
                .await?;
            run.afterscript_exit_code = Some(afterscript_exit);
            if afterscript_exit != 0 {
                self.sink.line(&job.name, true, &format!("WARN after_script exited {afterscript_exit}"));
            }
        }

        if prescript_exit == 0 && !job.artifacts.paths.is_empty() {
            match &container_id {
                None => {
                    let artifacts_dir = self.config.artifacts_dir(&job.name);
                    let _ = artifacts::extract_shell(job, scope, &build_dir, &artifacts_dir);
                }
                Some(_) => {
                    if let Err(e) = self.extract_container_artifacts(job, run, scope).await {
                        tracing::warn!(job = %job.name, error = %e, "container artifact extraction failed");
                    }
                }
            }
        }

        if let Some(pattern) = &job.coverage {
            let log_text = std::fs::read_to_string(log_path).unwrap_or_default();
            run.coverage = Some(coverage::extract(&log_text, pattern));
        }

        Ok(())
    }

    /// Runs one script phase (`before_script`+`script`, or `after_script`),
    /// racing it against a fresh silence watchdog that speaks up on the
    /// sink if the phase goes quiet too long. The watchdog future never
    /// completes on its own, so whichever `select!` branch wins is always
    /// the script execution; the watchdog simply gets dropped alongside it.
    async fn run_script_phase(
        &self,
        job: &Job,
        container_id: &Option<String>,
        build_dir: &Path,
        env: &BTreeMap<String, String>,
        lines: &[String],
        log_path: &Path,
    ) -> Result<i32, String> {
        if lines.is_empty() {
            return Ok(0);
        }

        let script_body = script::compose(lines, if container_id.is_none() { Some(env) } else { None });
        let watchdog = SilenceWatchdog::new(DEFAULT_SILENCE_WINDOW);

        let exit_code = if let Some(id) = container_id {
            let run_fut = self.runtime.start_attached(id, &script_body, &|is_err, line| {
                watchdog.kick();
                self.sink.line(&job.name, is_err, line);
            });
            let watch_fut = watchdog.clone().watch(|| self.sink.line(&job.name, false, "> still running..."));

            tokio::select! {
                res = run_fut => res.map_err(|e| e.to_string())?.exit_code,
                () = watch_fut => unreachable!("the watchdog only returns once stopped, and nothing stops it before run_fut completes"),
            }
        } else {
            let log_file = std::sync::Mutex::new(
                std::fs::OpenOptions::new()
                    .append(true)
                    .open(log_path)
                    .map_err(|e| e.to_string())?,
            );

            let run_fut = spawn_shell_streaming(&script_body, build_dir, env, &|is_err, line| {
                watchdog.kick();
                self.sink.line(&job.name, is_err, line);
                if let Ok(mut f) = log_file.lock() {
                    let _ = writeln!(f, "{line}");
                }
            });
            let watch_fut = watchdog.clone().watch(|| self.sink.line(&job.name, false, "> still running..."));

            tokio::select! {
                res = run_fut => res?,
                () = watch_fut => unreachable!("the watchdog only returns once stopped, and nothing stops it before run_fut completes"),
            }
        };

        Ok(exit_code)
    }

    /// Phase 4 (container mode) — pulls the job's `/builds` volume onto the
    /// host through a disposable `debian:stable-slim` sidecar bound to the
    /// same volume, then glob-extracts artifacts from the staged copy the
    /// same way shell mode does.
    async fn extract_container_artifacts(
        &self,
        job: &Job,
        run: &mut JobRun,
        scope: &Scope,
    ) -> Result<(), String> {
        let Some(volume_name) = run.volume_name.clone() else {
            return Ok(());
        };

        let spec = container::build_artifacts_sidecar_spec(job, run.job_id, &volume_name);
        let sidecar_id = container::create(self.runtime, &spec).await.map_err(|e| e.to_string())?;
        run.artifacts_container_id = Some(sidecar_id.clone());

        let staging_dir = self.config.gitlab_ci_local_dir.join("tmp").join(safe_name(&job.name));
        let _ = std::fs::remove_dir_all(&staging_dir);
        std::fs::create_dir_all(&staging_dir).map_err(|e| e.to_string())?;

        self.runtime
            .copy_from(&sidecar_id, Path::new("/builds"), &staging_dir)
            .await
            .map_err(|e| e.to_string())?;

        // `docker cp id:/builds dest` lands the tree at `dest/builds` when
        // `dest` already exists (which it does — we just created it).
        let staged_builds = staging_dir.join("builds");
        let source_root = if staged_builds.exists() { staged_builds } else { staging_dir.clone() };

        let artifacts_dir = self.config.artifacts_dir(&job.name);
        let _ = artifacts::extract_shell(job, scope, &source_root, &artifacts_dir);

        let _ = std::fs::remove_dir_all(&staging_dir);
        Ok(())
    }

    fn finalize_state(&self, job: &Job, run: &mut JobRun) {
        let prescript = run.prescript_exit_code.unwrap_or(-1);
        run.state = if prescript == 0 {
            RunState::Succeeded
        } else if job.allow_failure {
            RunState::WarnedFailure
        } else {
            RunState::Failed
        };
    }

    /// Phase 6 — guaranteed cleanup. Failures here are logged and
    /// swallowed; they never change the job's outcome.
    async fn cleanup(&self, run: &mut JobRun) {
        if let Some(id) = run.container_id.take() {
            if let Err(e) = self.runtime.remove_container(&id).await {
                tracing::warn!(container_id = %id, error = %e, "container cleanup failed");
            }
        }
        if let Some(id) = run.artifacts_container_id.take() {
            if let Err(e) = self.runtime.remove_container(&id).await {
                tracing::warn!(container_id = %id, error = %e, "artifacts container cleanup failed");
            }
        }
        if let Some(vol) = run.volume_name.take() {
            if let Err(e) = self.runtime.remove_volume(&vol).await {
                tracing::warn!(volume = %vol, error = %e, "volume cleanup failed");
            }
        }
    }
}

/// Runs `script_body` under `sh -c`, streaming each stdout/stderr line to
/// `on_line` as it arrives rather than buffering until exit — what lets the
/// silence watchdog fire for shell-mode jobs the same as it does for
/// container-mode ones.
async fn spawn_shell_streaming(
    script_body: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    on_line: &(dyn Fn(bool, &str) + Send + Sync),
) -> Result<i32, String> {
    let mut cmd = TokioCommand::new("sh");
    cmd.arg("-c")
        .arg(script_body)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    let mut stdout_lines = BufReader::new(child.stdout.take().expect("stdout was piped")).lines();
    let mut stderr_lines = BufReader::new(child.stderr.take().expect("stderr was piped")).lines();

    let mut stdout_done = false;
    let mut stderr_done = false;
    while !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line.map_err(|e| e.to_string())? {
                    Some(text) => on_line(false, &text),
                    None => stdout_done = true,
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line.map_err(|e| e.to_string())? {
                    Some(text) => on_line(true, &text),
                    None => stderr_done = true,
                }
            }
        }
    }

    let status = child.wait().await.map_err(|e| e.to_string())?;
    Ok(status.code().unwrap_or(-1))
}

fn copy_dir_merge(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_merge(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localci_core::job::{Artifacts, Cache};
    use localci_core::rules::When;
    use localci_runtime::runtime::fake::FakeRuntime;
    use crate::sink::MockSink;

    fn shell_job(name: &str, scripts: Vec<&str>, allow_failure: bool) -> Job {
        Job {
            name: name.into(),
            stage: "test".into(),
            image: None,
            before_scripts: vec![],
            scripts: scripts.into_iter().map(String::from).collect(),
            after_scripts: vec![],
            needs: None,
            variables: Scope::new(),
            artifacts: Artifacts::default(),
            cache: Cache::default(),
            interactive: false,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure,
        }
    }

    fn config(dir: &Path) -> JobEngineConfig {
        JobEngineConfig {
            project_dir: dir.to_path_buf(),
            gitlab_ci_local_dir: dir.join(".gitlab-ci-local"),
            home_dir: dir.join("fake-home"),
            extra_hosts: vec![],
            privileged: false,
        }
    }

    #[tokio::test]
    async fn shell_job_succeeds_with_empty_script() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let job = shell_job("noop", vec![], false);
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;
        assert!(matches!(run.state, RunState::Succeeded));
    }

    #[tokio::test]
    async fn allow_failure_becomes_warned_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let job = shell_job("flaky", vec!["exit 3"], true);
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;
        assert_eq!(run.prescript_exit_code, Some(3));
        assert!(matches!(run.state, RunState::WarnedFailure));

        let lines = sink.lines.lock().unwrap();
        assert!(
            lines.iter().any(|(_, _, text)| text.contains("WARN 3 ")),
            "expected a WARN line carrying the prescript exit code, got {lines:?}"
        );
    }

    #[tokio::test]
    async fn failure_without_allow_failure_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let job = shell_job("broken", vec!["exit 1"], false);
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;
        assert!(matches!(run.state, RunState::Failed));
    }

    #[tokio::test]
    async fn container_job_cleanup_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut job = shell_job("containerized", vec!["echo hi"], false);
        job.image = Some(localci_core::job::Image::new("alpine"));
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;

        assert!(matches!(run.state, RunState::Succeeded));
        assert_eq!(runtime.removed_containers.lock().unwrap().len(), 1);
        assert_eq!(runtime.removed_volumes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn container_job_with_artifacts_runs_extraction_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut job = shell_job("containerized", vec!["echo hi"], false);
        job.image = Some(localci_core::job::Image::new("alpine"));
        job.artifacts = Artifacts { paths: vec!["dist/*.bin".to_string()] };

        let run = engine.run(&job, 1, &Scope::new(), &[]).await;

        assert!(matches!(run.state, RunState::Succeeded));
        // Main container plus the throwaway artifacts sidecar, both removed.
        assert_eq!(runtime.removed_containers.lock().unwrap().len(), 2);
        assert_eq!(runtime.copy_from_calls.lock().unwrap().len(), 1);
        let (_, container_path, _) = &runtime.copy_from_calls.lock().unwrap()[0];
        assert_eq!(container_path, std::path::Path::new("/builds"));
    }

    #[tokio::test]
    async fn coverage_is_extracted_from_shell_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut job = shell_job("covered", vec!["echo 'Total coverage: 82.5%'"], false);
        job.coverage = Some(r"Total coverage: (\d+\.\d+)".to_string());
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;
        assert_eq!(run.coverage.as_deref(), Some("82.5"));
    }

    #[tokio::test]
    async fn shell_job_streams_output_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let job = shell_job("chatty", vec!["echo one", "echo two >&2", "echo three"], false);
        let run = engine.run(&job, 1, &Scope::new(), &[]).await;
        assert!(matches!(run.state, RunState::Succeeded));

        let lines = sink.lines.lock().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(_, _, text)| text.as_str()).collect();
        assert!(texts.contains(&"one"));
        assert!(texts.contains(&"two"));
        assert!(texts.contains(&"three"));
        assert!(lines.iter().any(|(_, is_err, text)| *is_err && text == "two"));
    }

    #[tokio::test]
    async fn container_jobs_sharing_a_cache_key_both_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut job_a = shell_job("build-a", vec!["echo hi"], false);
        job_a.image = Some(localci_core::job::Image::new("alpine"));
        job_a.cache = Cache { key: Some(localci_core::job::CacheKey::Literal("cargo".into())), paths: vec!["target".into()] };

        let mut job_b = shell_job("build-b", vec!["echo hi"], false);
        job_b.image = Some(localci_core::job::Image::new("alpine"));
        job_b.cache = job_a.cache.clone();

        let (run_a, run_b) = tokio::join!(
            engine.run(&job_a, 1, &Scope::new(), &[]),
            engine.run(&job_b, 2, &Scope::new(), &[]),
        );

        assert!(matches!(run_a.state, RunState::Succeeded));
        assert!(matches!(run_b.state, RunState::Succeeded));
    }
}
