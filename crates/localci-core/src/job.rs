//! Job descriptors and the filesystem-safe name encoding.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::rules::When;
use crate::variables::Scope;

/// Names a job may not use — they are reserved pipeline-file keywords.
pub const RESERVED_NAMES: &[&str] = &[
    "include",
    "image",
    "services",
    "stages",
    "types",
    "before_script",
    "default",
    "after_script",
    "variables",
    "cache",
    "workflow",
    "pages",
];

/// A container image reference, optionally overriding the entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub entrypoint: Option<Vec<String>>,
}

impl Image {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.contains(':') {
            name.push_str(":latest");
        }
        Self { name, entrypoint: None }
    }
}

/// A cache key, either a literal string or derived from a file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheKey {
    Literal(String),
    Files { files: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Cache {
    pub key: Option<CacheKey>,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Artifacts {
    pub paths: Vec<String>,
}

/// Immutable, compiled job descriptor. Produced by the pipeline compiler;
/// never mutated again — runtime state lives in [`JobRun`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub stage: String,
    pub image: Option<Image>,
    pub before_scripts: Vec<String>,
    pub scripts: Vec<String>,
    pub after_scripts: Vec<String>,
    pub needs: Option<Vec<String>>,
    pub variables: Scope,
    pub artifacts: Artifacts,
    pub cache: Cache,
    pub interactive: bool,
    pub inject_ssh_agent: bool,
    pub coverage: Option<String>,
    pub when: When,
    pub allow_failure: bool,
}

impl Job {
    /// Checks the structural invariants from the data model: `interactive`
    /// implies manual + no image; SSH injection implies an image is set.
    pub fn validate(&self) -> Result<(), String> {
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(format!("`{}` is a reserved name and cannot be used as a job", self.name));
        }
        if self.interactive && self.when != When::Manual {
            return Err(format!("job `{}` is interactive but not `when: manual`", self.name));
        }
        if self.interactive && self.image.is_some() {
            return Err(format!("job `{}` is interactive and cannot run in a container", self.name));
        }
        if self.inject_ssh_agent && self.image.is_none() {
            return Err(format!("job `{}` requests SSH agent injection but has no image", self.name));
        }
        Ok(())
    }
}

/// Whether a name denotes a hidden template (`.foo`), not a runnable job.
#[must_use]
pub fn is_template(name: &str) -> bool {
    name.starts_with('.')
}

/// Terminal and non-terminal states of a single job's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Eligible,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Manual,
    WarnedFailure,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::Skipped
                | RunState::Manual
                | RunState::WarnedFailure
        )
    }

    /// Terminal states that do not block a successor from becoming eligible.
    #[must_use]
    pub fn unblocks_successors(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::WarnedFailure | RunState::Skipped)
    }
}

/// Mutable runtime state for one job within one pipeline invocation.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job_id: u64,
    pub state: RunState,
    pub prescript_exit_code: Option<i32>,
    pub afterscript_exit_code: Option<i32>,
    pub coverage: Option<String>,
    pub container_id: Option<String>,
    pub artifacts_container_id: Option<String>,
    pub volume_name: Option<String>,
    pub started_at: Option<SystemTime>,
}

impl JobRun {
    #[must_use]
    pub fn new(job_id: u64) -> Self {
        Self {
            job_id,
            state: RunState::Pending,
            prescript_exit_code: None,
            afterscript_exit_code: None,
            coverage: None,
            container_id: None,
            artifacts_container_id: None,
            volume_name: None,
            started_at: None,
        }
    }
}

/// Crockford base-32 alphabet, used to encode non-filesystem-safe bytes.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Digit width of each escaped code point: 5 base-32 digits cover the full
/// 21-bit Unicode scalar value range (max `0x10FFFF`).
const ESCAPE_DIGITS: usize = 5;

/// Maps an arbitrary job name to a string matching `[A-Za-z0-9_-]*`,
/// injectively. ASCII alphanumeric characters pass through unchanged;
/// every other character — including a literal `_` or `-` — is replaced
/// by `_` followed by a fixed-width Crockford base-32 encoding of its
/// Unicode scalar value. `_` never occurs as a pass-through character, so
/// every escape is unambiguous: the output can always be parsed back into
/// the exact original character sequence, which is what makes distinct
/// inputs map to distinct outputs.
#[must_use]
pub fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            out.push('_');
            out.push_str(&encode_fixed_width(ch as u32));
        }
    }
    out
}

fn encode_fixed_width(mut value: u32) -> String {
    let mut digits = [b'0'; ESCAPE_DIGITS];
    for slot in digits.iter_mut().rev() {
        *slot = CROCKFORD[(value % 32) as usize];
        value /= 32;
    }
    String::from_utf8(digits.to_vec()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_passes_through_alphanumeric_names() {
        assert_eq!(safe_name("buildjob1"), "buildjob1");
    }

    #[test]
    fn safe_name_encodes_special_and_reserved_chars() {
        let encoded = safe_name("build-job_1:test");
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(!encoded.contains('~'));
        assert_ne!(encoded, "build-job_1:test");
    }

    #[test]
    fn safe_name_is_injective_on_sample_inputs() {
        let inputs = ["a:b", "a/b", "a b", "a:b:c", "ab", "a-b", "a_b", "a__b"];
        let mut seen = std::collections::HashSet::new();
        for input in inputs {
            assert!(seen.insert(safe_name(input)), "collision encoding {input:?}");
        }
    }

    #[test]
    fn interactive_requires_manual() {
        let job = Job {
            name: "t".into(),
            stage: "test".into(),
            image: None,
            before_scripts: vec![],
            scripts: vec![],
            after_scripts: vec![],
            needs: None,
            variables: Scope::new(),
            artifacts: Artifacts::default(),
            cache: Cache::default(),
            interactive: true,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure: false,
        };
        assert!(job.validate().is_err());
    }

    #[test]
    fn reserved_name_rejected() {
        let job = Job {
            name: "variables".into(),
            stage: "test".into(),
            image: None,
            before_scripts: vec![],
            scripts: vec![],
            after_scripts: vec![],
            needs: None,
            variables: Scope::new(),
            artifacts: Artifacts::default(),
            cache: Cache::default(),
            interactive: false,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure: false,
        };
        assert!(job.validate().is_err());
    }
}
