//! Wave-based dispatch: a job becomes eligible once every predecessor is
//! terminal and none of them failed outright; eligible jobs in the same
//! wave run concurrently, in lexicographic order for deterministic logs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use localci_core::job::{is_template, Job, JobRun, RunState};
use localci_core::pipeline_config::PipelineConfig;
use localci_core::rules::When;
use localci_core::variables::Scope;
use localci_engine::JobEngine;

use crate::dag;
use crate::error::{SchedulerError, SchedulerErrorKind};

/// What to run and how hard to push concurrency.
pub struct SchedulerConfig {
    /// Jobs the caller named explicitly (`--job`/`--jobs`), before any
    /// `--needs` expansion.
    pub requested: BTreeSet<String>,
    /// Whether to pull in transitive predecessors not named in `requested`.
    pub expand_needs: bool,
    /// Upper bound on jobs running at once. `None` means unbounded.
    pub concurrency: Option<usize>,
}

/// Final record of one pipeline invocation.
pub struct PipelineOutcome {
    pub runs: BTreeMap<String, JobRun>,
    pub states: BTreeMap<String, RunState>,
}

impl PipelineOutcome {
    /// Exit status per the data model: 0 iff every selected job landed in
    /// `Succeeded`, `WarnedFailure`, or `Skipped`. A job stuck `Pending`
    /// behind an un-triggered manual gate, or genuinely `Failed`, fails it.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.states.values().all(|s| s.unblocks_successors())
    }
}

/// Runs one [`PipelineConfig`] to completion against a single [`JobEngine`].
pub struct PipelineRunner<'a> {
    engine: &'a JobEngine<'a>,
    base_scope: &'a Scope,
    artifacts_dir_for: &'a (dyn Fn(&str) -> PathBuf + Sync),
}

impl<'a> PipelineRunner<'a> {
    #[must_use]
    pub fn new(
        engine: &'a JobEngine<'a>,
        base_scope: &'a Scope,
        artifacts_dir_for: &'a (dyn Fn(&str) -> PathBuf + Sync),
    ) -> Self {
        Self { engine, base_scope, artifacts_dir_for }
    }

    pub async fn run(
        &self,
        pipeline: &PipelineConfig,
        config: &SchedulerConfig,
    ) -> Result<PipelineOutcome, SchedulerError> {
        let selection = if config.expand_needs {
            dag::expand_selection(pipeline, &config.requested)
        } else {
            dag::check_external_predecessors(pipeline, &config.requested, |name| {
                (self.artifacts_dir_for)(name).exists()
            })
            .map_err(SchedulerError)?;
            config.requested.clone()
        };

        let mut states: BTreeMap<String, RunState> = BTreeMap::new();
        // Manual jobs the caller did not explicitly select: parked forever at
        // `Pending` (never dispatched) and, per the predecessor rule, never a
        // blocker for whatever comes after them once every other predecessor
        // has terminated.
        let mut parked_manual: BTreeSet<String> = BTreeSet::new();
        for name in &selection {
            let Some(job) = pipeline.jobs.get(name) else {
                return Err(SchedulerError(SchedulerErrorKind::UnknownJob(name.clone())));
            };
            if is_template(name) {
                continue;
            }
            let initial = match job.when {
                When::Never => RunState::Skipped,
                When::Manual if !config.requested.contains(name) => {
                    parked_manual.insert(name.clone());
                    RunState::Pending
                }
                _ => RunState::Pending,
            };
            states.insert(name.clone(), initial);
        }

        let mut runs: BTreeMap<String, JobRun> = BTreeMap::new();
        let semaphore = config.concurrency.map(Semaphore::new);
        let sem_ref = semaphore.as_ref();
        let mut next_job_id: u64 = 1;

        loop {
            let mut eligible: Vec<&Job> = Vec::new();

            for name in &selection {
                if states.get(name) != Some(&RunState::Pending) {
                    continue;
                }
                if parked_manual.contains(name) {
                    continue;
                }
                let job = &pipeline.jobs[name];
                let preds = dag::predecessors_of(pipeline, job);

                let mut blocked = false;
                let mut failed_predecessor = false;
                for pred in &preds {
                    if parked_manual.contains(pred) {
                        continue;
                    }
                    match states.get(pred) {
                        Some(state) if state.is_terminal() => {
                            if matches!(state, RunState::Failed) {
                                failed_predecessor = true;
                            } else if !state.unblocks_successors() {
                                blocked = true;
                            }
                        }
                        Some(_) => blocked = true,
                        None => {}
                    }
                }

                if failed_predecessor {
                    states.insert(name.clone(), RunState::Skipped);
                    continue;
                }
                if blocked {
                    continue;
                }
                eligible.push(job);
            }

            if eligible.is_empty() {
                break;
            }

            eligible.sort_by(|a, b| a.name.cmp(&b.name));

            let mut wave = FuturesUnordered::new();
            for &job in &eligible {
                states.insert(job.name.clone(), RunState::Running);
                let job_id = next_job_id;
                next_job_id += 1;

                let scope = Scope::compose([self.base_scope.clone(), job.variables.clone()]);
                let input_dirs: Vec<PathBuf> = dag::predecessors_of(pipeline, job)
                    .into_iter()
                    .map(|pred| (self.artifacts_dir_for)(&pred))
                    .filter(|dir| dir.exists())
                    .collect();

                wave.push(async move {
                    let _permit = match sem_ref {
                        Some(sem) => Some(sem.acquire().await.expect("scheduler semaphore is never closed")),
                        None => None,
                    };
                    let run = self.engine.run(job, job_id, &scope, &input_dirs).await;
                    (job.name.clone(), run)
                });
            }

            while let Some((name, run)) = wave.next().await {
                tracing::info!(job = %name, state = ?run.state, "job finished");
                states.insert(name.clone(), run.state);
                runs.insert(name, run);
            }
        }

        Ok(PipelineOutcome { runs, states })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localci_core::job::{Artifacts, Cache};
    use localci_core::pipeline_config::DEFAULT_STAGES;
    use localci_engine::{JobEngineConfig, MockSink};
    use localci_runtime::runtime::fake::FakeRuntime;

    fn job(name: &str, stage: &str, needs: Option<Vec<&str>>, script: &str, allow_failure: bool) -> Job {
        Job {
            name: name.into(),
            stage: stage.into(),
            image: None,
            before_scripts: vec![],
            scripts: vec![script.into()],
            after_scripts: vec![],
            needs: needs.map(|v| v.into_iter().map(String::from).collect()),
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

    fn config(dir: &std::path::Path) -> JobEngineConfig {
        JobEngineConfig {
            project_dir: dir.to_path_buf(),
            gitlab_ci_local_dir: dir.join(".gitlab-ci-local"),
            home_dir: dir.join("fake-home"),
            extra_hosts: vec![],
            privileged: false,
        }
    }

    #[tokio::test]
    async fn runs_two_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut pipeline =
            PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        for j in [job("compile", "build", None, "echo building", false), job("unit-test", "test", None, "echo testing", false)] {
            pipeline.jobs.insert(j.name.clone(), j);
        }

        let base_scope = Scope::new();
        let artifacts_dir_for = |name: &str| dir.path().join("artifacts").join(name);
        let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

        let scheduler_config = SchedulerConfig {
            requested: BTreeSet::from(["compile".to_string(), "unit-test".to_string()]),
            expand_needs: false,
            concurrency: None,
        };

        let outcome = runner.run(&pipeline, &scheduler_config).await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.states["compile"], RunState::Succeeded);
        assert_eq!(outcome.states["unit-test"], RunState::Succeeded);
    }

    #[tokio::test]
    async fn failed_predecessor_skips_successor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime { exit_code: 1, ..Default::default() };
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut pipeline =
            PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        for j in [job("compile", "build", None, "exit 1", false), job("unit-test", "test", Some(vec!["compile"]), "echo testing", false)] {
            pipeline.jobs.insert(j.name.clone(), j);
        }

        let base_scope = Scope::new();
        let artifacts_dir_for = |name: &str| dir.path().join("artifacts").join(name);
        let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

        let scheduler_config = SchedulerConfig {
            requested: BTreeSet::from(["compile".to_string(), "unit-test".to_string()]),
            expand_needs: false,
            concurrency: None,
        };

        let outcome = runner.run(&pipeline, &scheduler_config).await.unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.states["compile"], RunState::Failed);
        assert_eq!(outcome.states["unit-test"], RunState::Skipped);
        assert!(!outcome.runs.contains_key("unit-test"), "skipped job never actually ran");
    }

    #[tokio::test]
    async fn allow_failure_predecessor_unblocks_successor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime { exit_code: 1, ..Default::default() };
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut pipeline =
            PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        for j in [job("flaky", "build", None, "exit 1", true), job("unit-test", "test", Some(vec!["flaky"]), "echo testing", false)] {
            pipeline.jobs.insert(j.name.clone(), j);
        }

        let base_scope = Scope::new();
        let artifacts_dir_for = |name: &str| dir.path().join("artifacts").join(name);
        let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

        let scheduler_config = SchedulerConfig {
            requested: BTreeSet::from(["flaky".to_string(), "unit-test".to_string()]),
            expand_needs: false,
            concurrency: None,
        };

        let outcome = runner.run(&pipeline, &scheduler_config).await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.states["flaky"], RunState::WarnedFailure);
        assert_eq!(outcome.states["unit-test"], RunState::Succeeded);
    }

    #[tokio::test]
    async fn rule_skip_never_runs_job() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut pipeline =
            PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        let mut skipped = job("deploy-review", "deploy", None, "echo deploying", false);
        skipped.when = When::Never;
        pipeline.jobs.insert(skipped.name.clone(), skipped);

        let base_scope = Scope::new();
        let artifacts_dir_for = |name: &str| dir.path().join("artifacts").join(name);
        let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

        let scheduler_config = SchedulerConfig {
            requested: BTreeSet::from(["deploy-review".to_string()]),
            expand_needs: false,
            concurrency: None,
        };

        let outcome = runner.run(&pipeline, &scheduler_config).await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.states["deploy-review"], RunState::Skipped);
        assert!(!outcome.runs.contains_key("deploy-review"));
    }

    #[tokio::test]
    async fn unselected_manual_job_parks_without_blocking_successor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let runtime = FakeRuntime::default();
        let sink = MockSink::default();
        let engine = JobEngine::new(&runtime, &sink, &cfg);

        let mut pipeline =
            PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        let mut gate = job("promote", "deploy", None, "echo promoting", false);
        gate.when = When::Manual;
        let downstream = job("post-deploy-check", ".post", Some(vec!["promote"]), "echo checking", false);
        pipeline.jobs.insert(gate.name.clone(), gate);
        pipeline.jobs.insert(downstream.name.clone(), downstream);

        let base_scope = Scope::new();
        let artifacts_dir_for = |name: &str| dir.path().join("artifacts").join(name);
        let runner = PipelineRunner::new(&engine, &base_scope, &artifacts_dir_for);

        let scheduler_config = SchedulerConfig {
            requested: BTreeSet::from(["post-deploy-check".to_string()]),
            expand_needs: true,
            concurrency: None,
        };

        let outcome = runner.run(&pipeline, &scheduler_config).await.unwrap();
        // The un-triggered manual gate parks forever, so the overall run
        // still can't report success...
        assert!(!outcome.succeeded(), "an un-triggered manual gate should not let the run report success");
        assert_eq!(outcome.states["promote"], RunState::Pending);
        // ...but it must not block `post-deploy-check`, whose only
        // predecessor is that parked gate, from actually running.
        assert_eq!(outcome.states["post-deploy-check"], RunState::Succeeded);
        assert!(outcome.runs.contains_key("post-deploy-check"));
        assert!(!outcome.runs.contains_key("promote"), "parked manual job never actually ran");
    }
}
