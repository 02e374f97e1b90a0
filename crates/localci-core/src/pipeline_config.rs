//! The compiled pipeline: stages, global defaults, and the job table.

use std::collections::BTreeMap;

use crate::job::Job;
use crate::validation::{ValidationError, ValidationResult};
use crate::variables::Scope;

/// Default stage order when a pipeline file declares none.
pub const DEFAULT_STAGES: &[&str] = &[".pre", "build", "test", "deploy", ".post"];

/// The fully compiled, ready-to-schedule pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stages: Vec<String>,
    pub global_variables: Scope,
    pub jobs: BTreeMap<String, Job>,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(stages: Vec<String>, global_variables: Scope) -> Self {
        Self {
            stages,
            global_variables,
            jobs: BTreeMap::new(),
        }
    }

    /// Index of a stage name in the declared stage order.
    #[must_use]
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Every job whose stage sorts strictly earlier than `job`'s.
    #[must_use]
    pub fn jobs_in_earlier_stages(&self, job: &Job) -> Vec<&Job> {
        let Some(idx) = self.stage_index(&job.stage) else {
            return Vec::new();
        };
        self.jobs
            .values()
            .filter(|other| self.stage_index(&other.stage).is_some_and(|i| i < idx))
            .collect()
    }

    /// Checks pipeline-wide invariants: unique stage names, every job's
    /// stage declared, every explicit `needs` target exists.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage) {
                return Err(ValidationError::DuplicateStage { name: stage.clone() });
            }
        }

        for job in self.jobs.values() {
            if self.stage_index(&job.stage).is_none() {
                return Err(ValidationError::InvalidStep {
                    reason: format!("job `{}` declares unknown stage `{}`", job.name, job.stage),
                });
            }
            job.validate().map_err(|reason| ValidationError::InvalidStep { reason })?;

            if let Some(needs) = &job.needs {
                let missing: Vec<&str> = needs
                    .iter()
                    .filter(|n| !self.jobs.contains_key(n.as_str()))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(ValidationError::MissingNeeds {
                        job: job.name.clone(),
                        missing: missing.iter().map(|s| s.to_string()).collect(),
                    });
                }
            }
        }

        Ok(())
    }
}
