//! Phase 4 — artifact extraction.
//!
//! Shell-mode jobs are copied directly off the prepared build directory;
//! container-mode jobs are copied out through the [`Runtime`] (the caller
//! decides which, since only it knows whether the job used a container).

use std::path::{Path, PathBuf};

use glob::glob;
use localci_core::job::Job;
use localci_core::variables::{expand_text, Scope};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactErrorKind {
    #[error("invalid artifact glob `{pattern}`: {source}")]
    InvalidGlob { pattern: String, source: glob::PatternError },
    #[error("failed to copy artifact {src} -> {dst}: {source}")]
    Copy { src: PathBuf, dst: PathBuf, source: std::io::Error },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ArtifactError(#[from] pub ArtifactErrorKind);

/// Copies every path matched by `job.artifacts.paths` (after `$VAR`
/// expansion) from `build_dir` into `artifacts_dir`, preserving relative
/// structure (`cp -r --parents` equivalent). Shared by both extraction
/// modes: shell-mode calls it directly against the prepared workspace,
/// container-mode calls it against a host-side staging copy of `/builds`
/// pulled out through the sidecar (see [`crate::container`]).
pub fn extract_shell(job: &Job, scope: &Scope, build_dir: &Path, artifacts_dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut copied = Vec::new();
    std::fs::create_dir_all(artifacts_dir).ok();

    for raw_pattern in &job.artifacts.paths {
        let pattern = expand_text(raw_pattern, scope);
        let full_pattern = build_dir.join(&pattern).to_string_lossy().to_string();

        let matches = glob(&full_pattern)
            .map_err(|source| ArtifactErrorKind::InvalidGlob { pattern: full_pattern.clone(), source })?;

        for entry in matches.flatten() {
            if !entry.is_file() {
                continue;
            }
            let relative = entry.strip_prefix(build_dir).unwrap_or(&entry);
            let dest = artifacts_dir.join(relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::copy(&entry, &dest).map_err(|source| ArtifactErrorKind::Copy {
                src: entry.clone(),
                dst: dest.clone(),
                source,
            })?;
            copied.push(dest);
        }
    }

    Ok(copied)
}
