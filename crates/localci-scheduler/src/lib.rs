//! # localci-scheduler
//!
//! Orders and dispatches a compiled [`localci_core::PipelineConfig`]'s jobs:
//! computes each job's predecessors (`needs`, or every job in an earlier
//! stage), waits for them to go terminal, and hands eligible jobs to a
//! [`localci_engine::JobEngine`] in lexicographic waves, bounded by an
//! optional concurrency cap.
//!
//! This crate owns no execution mechanics of its own — container lifecycle,
//! script composition, and artifact extraction all live in `localci-engine`.
//! It only decides *when* a job may run and *with what predecessors'
//! artifacts already on disk*.

#![warn(unused)]

pub mod dag;
pub mod dispatch;
pub mod error;

pub use dag::{check_external_predecessors, expand_selection, predecessors_of};
pub use dispatch::{PipelineOutcome, PipelineRunner, SchedulerConfig};
pub use error::{SchedulerError, SchedulerErrorKind};

/// localci-scheduler version.
pub const VERSION: &str = "0.1.0";
