//! Pipeline configuration validation errors and the reusable `Validate` trait.

use thiserror::Error;

/// Validation result type.
pub type ValidationResult<T = ()> = Result<T, ValidationError>;

/// Configuration errors detected while compiling a pipeline. All of these
/// are fatal at compile time: the pipeline never starts running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pipeline must have at least one stage")]
    EmptyStages,

    #[error("stage name cannot be empty")]
    EmptyName,

    #[error("duplicate stage name '{name}'")]
    DuplicateStage { name: String },

    #[error("invalid step configuration: {reason}")]
    InvalidStep { reason: String },

    #[error("[ {} ] jobs are needed by {job}, but they cannot be found", .missing.join(", "))]
    MissingNeeds { job: String, missing: Vec<String> },

    #[error("include cycle detected: {0}")]
    IncludeCycle(String),

    #[error("failed to resolve include `{0}`: {1}")]
    UnresolvedInclude(String, String),

    #[error("job `{0}` extends unknown job `{1}`")]
    UnknownExtends(String, String),

    #[error("rule expression error in job `{job}`: {message}")]
    RuleExpression { job: String, message: String },

    #[error("validation error at {path}: {error}")]
    WithPath { path: String, error: Box<ValidationError> },
}

/// Trait for validatable types, reused by every crate's own config structs.
pub trait Validate {
    type Error;
    fn validate(&self) -> Result<(), Self::Error>;
}

impl<T: Validate> Validate for Option<T> {
    type Error = T::Error;
    fn validate(&self) -> Result<(), Self::Error> {
        match self {
            Some(value) => value.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate> Validate for Vec<T> {
    type Error = T::Error;
    fn validate(&self) -> Result<(), Self::Error> {
        for item in self {
            item.validate()?;
        }
        Ok(())
    }
}

/// Tracks the current structural path while walking a nested config, so
/// errors can be reported with a dotted location like `jobs.build.rules.0`.
#[derive(Debug, Default)]
pub struct ValidationContext {
    path: Vec<String>,
}

impl ValidationContext {
    #[must_use]
    pub fn new() -> Self {
        Self { path: Vec::new() }
    }

    pub fn push(&mut self, component: impl Into<String>) {
        self.path.push(component.into());
    }

    pub fn pop(&mut self) {
        self.path.pop();
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    pub fn wrap(&self, error: ValidationError) -> ValidationError {
        if self.path.is_empty() {
            error
        } else {
            ValidationError::WithPath {
                path: self.path(),
                error: Box::new(error),
            }
        }
    }
}

pub mod rules {
    use super::ValidationError;

    pub fn validate_name(name: &str) -> Result<(), ValidationError> {
        if name.trim().is_empty() {
            Err(ValidationError::EmptyName)
        } else {
            Ok(())
        }
    }

    pub fn validate_unique_stages(stages: &[String]) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for stage in stages {
            if !seen.insert(stage) {
                return Err(ValidationError::DuplicateStage { name: stage.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_needs_message_matches_contract() {
        let err = ValidationError::MissingNeeds {
            job: "test-job".to_string(),
            missing: vec!["invalid".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "[ invalid ] jobs are needed by test-job, but they cannot be found"
        );
    }

    #[test]
    fn validation_context_path() {
        let mut ctx = ValidationContext::new();
        ctx.push("jobs");
        ctx.push("build");
        assert_eq!(ctx.path(), "jobs.build");
    }

    #[test]
    fn validate_unique_stages_detects_duplicate() {
        let stages = vec!["build".to_string(), "build".to_string()];
        assert!(rules::validate_unique_stages(&stages).is_err());
    }
}
