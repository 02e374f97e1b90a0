//! Common imports for downstream crates.
//!
//! ```
//! use localci_core::prelude::*;
//! ```

pub use crate::compiler::{CompileError, Compiler, IncludeFetcher, ProcessFetcher, TemplateLibrary};
pub use crate::git::{GitInfo, RemoteParts};
pub use crate::job::{safe_name, Artifacts, Cache, CacheKey, Image, Job, JobRun, RunState};
pub use crate::pipeline_config::PipelineConfig;
pub use crate::process::{spawn, spawn_allow_failure, SpawnError, SpawnOutput};
pub use crate::rules::{evaluate_rules, Rule, RuleError, RuleOutcome, When};
pub use crate::validation::{Validate, ValidationError, ValidationResult};
pub use crate::variables::{expand_text, expand_variables, Scope};
