//! Scheduler-specific errors — raised before a single job ever runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerErrorKind {
    #[error("job `{job}` needs `{needed}`, which is neither selected nor has artifacts on disk")]
    MissingExternalPredecessor { job: String, needed: String },
    #[error("selected job `{0}` is not defined in this pipeline")]
    UnknownJob(String),
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct SchedulerError(#[from] pub SchedulerErrorKind);
