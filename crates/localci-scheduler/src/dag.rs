//! Predecessor computation: explicit `needs` when declared, otherwise every
//! job in an earlier stage — the two predecessor models named in the data
//! model, never mixed for a single job.

use std::collections::BTreeSet;

use localci_core::job::{is_template, Job};
use localci_core::pipeline_config::PipelineConfig;

use crate::error::SchedulerErrorKind;

/// The jobs `job` must wait on before it can become eligible.
#[must_use]
pub fn predecessors_of(pipeline: &PipelineConfig, job: &Job) -> BTreeSet<String> {
    match &job.needs {
        Some(needs) => needs.iter().cloned().collect(),
        None => pipeline
            .jobs_in_earlier_stages(job)
            .into_iter()
            .filter(|other| !is_template(&other.name))
            .map(|other| other.name.clone())
            .collect(),
    }
}

/// Closes `requested` transitively over [`predecessors_of`] — the `--needs`
/// flag's behavior: pull in every job a requested job (directly or
/// transitively) depends on, so it actually has something to run against.
#[must_use]
pub fn expand_selection(pipeline: &PipelineConfig, requested: &BTreeSet<String>) -> BTreeSet<String> {
    let mut selection = requested.clone();
    let mut frontier: Vec<String> = requested.iter().cloned().collect();

    while let Some(name) = frontier.pop() {
        let Some(job) = pipeline.jobs.get(&name) else { continue };
        for pred in predecessors_of(pipeline, job) {
            if selection.insert(pred.clone()) {
                frontier.push(pred);
            }
        }
    }

    selection
}

/// Without `--needs`, a predecessor left out of the selection is never run
/// by this invocation — it must already have artifacts on disk from a prior
/// run, checked up front rather than discovered mid-pipeline.
pub fn check_external_predecessors(
    pipeline: &PipelineConfig,
    selection: &BTreeSet<String>,
    artifacts_present: impl Fn(&str) -> bool,
) -> Result<(), SchedulerErrorKind> {
    for name in selection {
        let Some(job) = pipeline.jobs.get(name) else {
            return Err(SchedulerErrorKind::UnknownJob(name.clone()));
        };
        for pred in predecessors_of(pipeline, job) {
            if !selection.contains(&pred) && !artifacts_present(&pred) {
                return Err(SchedulerErrorKind::MissingExternalPredecessor {
                    job: name.clone(),
                    needed: pred,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localci_core::job::{Artifacts, Cache};
    use localci_core::pipeline_config::DEFAULT_STAGES;
    use localci_core::rules::When;
    use localci_core::variables::Scope;

    fn job(name: &str, stage: &str, needs: Option<Vec<&str>>) -> Job {
        Job {
            name: name.into(),
            stage: stage.into(),
            image: None,
            before_scripts: vec![],
            scripts: vec!["echo hi".into()],
            after_scripts: vec![],
            needs: needs.map(|v| v.into_iter().map(String::from).collect()),
            variables: Scope::new(),
            artifacts: Artifacts::default(),
            cache: Cache::default(),
            interactive: false,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure: false,
        }
    }

    fn pipeline() -> PipelineConfig {
        let mut cfg = PipelineConfig::new(DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(), Scope::new());
        for j in [
            job("compile", "build", None),
            job("lint", "build", None),
            job("unit-test", "test", Some(vec!["compile"])),
            job("integration-test", "test", None),
        ] {
            cfg.jobs.insert(j.name.clone(), j);
        }
        cfg
    }

    #[test]
    fn explicit_needs_wins_over_stage_order() {
        let cfg = pipeline();
        let preds = predecessors_of(&cfg, &cfg.jobs["unit-test"]);
        assert_eq!(preds, BTreeSet::from(["compile".to_string()]));
    }

    #[test]
    fn absent_needs_falls_back_to_earlier_stages() {
        let cfg = pipeline();
        let preds = predecessors_of(&cfg, &cfg.jobs["integration-test"]);
        assert_eq!(preds, BTreeSet::from(["compile".to_string(), "lint".to_string()]));
    }

    #[test]
    fn expand_selection_pulls_in_transitive_needs() {
        let cfg = pipeline();
        let requested = BTreeSet::from(["unit-test".to_string()]);
        let expanded = expand_selection(&cfg, &requested);
        assert_eq!(expanded, BTreeSet::from(["unit-test".to_string(), "compile".to_string()]));
    }

    #[test]
    fn missing_external_predecessor_without_artifacts_errors() {
        let cfg = pipeline();
        let selection = BTreeSet::from(["unit-test".to_string()]);
        let err = check_external_predecessors(&cfg, &selection, |_| false).unwrap_err();
        assert!(matches!(err, SchedulerErrorKind::MissingExternalPredecessor { .. }));
    }

    #[test]
    fn external_predecessor_with_artifacts_on_disk_is_fine() {
        let cfg = pipeline();
        let selection = BTreeSet::from(["unit-test".to_string()]);
        check_external_predecessors(&cfg, &selection, |_| true).unwrap();
    }
}
