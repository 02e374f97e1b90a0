//! Persistent `pipelineIid` counter.
//!
//! GitLab's pipeline IID increases per-project across runs; we approximate
//! that locally by persisting a counter next to the working tree. Written
//! write-temp-then-rename so a crash mid-write can never corrupt it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateErrorKind {
    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse state file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct StateError(#[from] pub StateErrorKind);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StateFile {
    #[serde(rename = "pipelineIid")]
    pipeline_iid: u64,
}

/// Reads the current iid (0 if the state file does not exist yet),
/// persists `current + 1`, and returns the value to use for this run.
pub fn next_pipeline_iid(gitlab_ci_local_dir: &Path) -> Result<u64, StateError> {
    let path = gitlab_ci_local_dir.join("state.json");

    let current = match fs::read_to_string(&path) {
        Ok(text) => {
            let parsed: StateFile = serde_json::from_str(&text)
                .map_err(|source| StateErrorKind::Parse { path: path.clone(), source })?;
            parsed.pipeline_iid
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(source) => return Err(StateErrorKind::Read { path, source }.into()),
    };

    let next = current + 1;
    write_state(gitlab_ci_local_dir, &path, next)?;
    Ok(next)
}

fn write_state(dir: &Path, path: &Path, pipeline_iid: u64) -> Result<(), StateError> {
    fs::create_dir_all(dir).map_err(|source| StateErrorKind::Write { path: path.to_path_buf(), source })?;

    let tmp_path = path.with_extension("json.tmp");
    let contents = serde_json::to_string(&StateFile { pipeline_iid })
        .expect("StateFile serialization cannot fail");
    fs::write(&tmp_path, contents).map_err(|source| StateErrorKind::Write { path: tmp_path.clone(), source })?;
    fs::rename(&tmp_path, path).map_err(|source| StateErrorKind::Write { path: path.to_path_buf(), source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_increments() {
        let dir = tempfile::tempdir().unwrap();
        let gcl = dir.path().join(".gitlab-ci-local");

        assert_eq!(next_pipeline_iid(&gcl).unwrap(), 1);
        assert_eq!(next_pipeline_iid(&gcl).unwrap(), 2);
        assert_eq!(next_pipeline_iid(&gcl).unwrap(), 3);
    }

    #[test]
    fn persists_across_separate_reads() {
        let dir = tempfile::tempdir().unwrap();
        let gcl = dir.path().join(".gitlab-ci-local");
        next_pipeline_iid(&gcl).unwrap();
        next_pipeline_iid(&gcl).unwrap();

        let contents = fs::read_to_string(gcl.join("state.json")).unwrap();
        assert!(contents.contains("\"pipelineIid\":2"));
    }
}
