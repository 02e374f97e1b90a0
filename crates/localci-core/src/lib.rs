//! # localci-core
//!
//! Compiles a GitLab-CI pipeline file into a concrete, schedulable
//! [`pipeline_config::PipelineConfig`]: include resolution, `extends`
//! merging, variable interpolation, and rule evaluation.
//!
//! This crate has no notion of containers, scheduling waves, or output
//! streaming — those live in `localci-runtime`, `localci-scheduler`, and
//! `localci-engine`, each built on top of the types defined here.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use localci_core::compiler::{Compiler, ProcessFetcher, TemplateLibrary};
//! use localci_core::git;
//!
//! let cwd = std::env::current_dir().unwrap();
//! let git_info = git::probe(&cwd).unwrap();
//! let fetcher = ProcessFetcher { cache_dir: cwd.join(".gitlab-ci-local/includes") };
//! let templates = TemplateLibrary::empty();
//! let compiler = Compiler::new(cwd, &fetcher, &templates);
//! let config = compiler.compile(Path::new(".gitlab-ci.yml"), &git_info, 1).unwrap();
//! ```

#![warn(unused)]

pub mod compiler;
pub mod git;
pub mod job;
pub mod pipeline_config;
pub mod prelude;
pub mod process;
pub mod rules;
pub mod state;
pub mod validation;
pub mod variables;

pub use compiler::{CompileError, Compiler};
pub use git::{probe, GitInfo};
pub use job::{safe_name, Job, JobRun, RunState};
pub use pipeline_config::PipelineConfig;
pub use process::{spawn, spawn_allow_failure, SpawnError, SpawnOutput};
pub use rules::{evaluate_rules, RuleError, RuleOutcome, When};
pub use validation::{Validate, ValidationError, ValidationResult};
pub use variables::{expand_text, expand_variables, Scope};

/// localci-core version.
pub const VERSION: &str = "0.1.0";
