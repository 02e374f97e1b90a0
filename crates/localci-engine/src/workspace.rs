//! Phase 1 — workspace prepare.
//!
//! Shell-mode jobs execute against a copy of the working tree under
//! `.gitlab-ci-local/builds/<safe-name>/`; container-mode jobs copy the
//! same tree into the container instead (handled in [`crate::container`]).
//! Either way the source tree is never mutated in place.

use std::path::{Path, PathBuf};

use glob::Pattern;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceErrorKind {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to create {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to copy {src} -> {dst}: {source}")]
    Copy { src: PathBuf, dst: PathBuf, source: std::io::Error },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct WorkspaceError(#[from] pub WorkspaceErrorKind);

/// Always excluded regardless of `.gitignore` content.
const ALWAYS_EXCLUDED: &[&str] = &[".git", ".gitlab-ci-local"];

/// Patterns parsed out of a root `.gitignore`, matched against paths
/// relative to the working tree root.
struct IgnoreSet(Vec<Pattern>);

impl IgnoreSet {
    fn load(root: &Path) -> Self {
        let mut patterns = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(root.join(".gitignore")) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let glob_str = if line.ends_with('/') {
                    format!("{}**", line)
                } else {
                    line.to_string()
                };
                if let Ok(pattern) = Pattern::new(&glob_str) {
                    patterns.push(pattern);
                }
            }
        }
        Self(patterns)
    }

    fn matches(&self, relative: &Path) -> bool {
        let as_str = relative.to_string_lossy();
        self.0.iter().any(|p| p.matches(&as_str))
    }
}

/// Recursively copies `source_root` into `dest_root`, skipping `.git`,
/// `.gitlab-ci-local`, and anything matched by the root `.gitignore`.
pub fn prepare_shell_workspace(source_root: &Path, dest_root: &Path) -> Result<(), WorkspaceError> {
    let ignores = IgnoreSet::load(source_root);
    std::fs::create_dir_all(dest_root).map_err(|source| WorkspaceErrorKind::CreateDir {
        path: dest_root.to_path_buf(),
        source,
    })?;
    copy_dir(source_root, dest_root, source_root, &ignores)
}

fn copy_dir(current: &Path, dest_root: &Path, source_root: &Path, ignores: &IgnoreSet) -> Result<(), WorkspaceError> {
    let entries = std::fs::read_dir(current).map_err(|source| WorkspaceErrorKind::Read {
        path: current.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| WorkspaceErrorKind::Read { path: current.to_path_buf(), source })?;
        let path = entry.path();
        let relative = path.strip_prefix(source_root).unwrap_or(&path);
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if ALWAYS_EXCLUDED.contains(&name.as_ref()) || ignores.matches(relative) {
            continue;
        }

        let dest_path = dest_root.join(relative);
        let file_type = entry.file_type().map_err(|source| WorkspaceErrorKind::Read {
            path: path.clone(),
            source,
        })?;

        if file_type.is_dir() {
            std::fs::create_dir_all(&dest_path).map_err(|source| WorkspaceErrorKind::CreateDir {
                path: dest_path.clone(),
                source,
            })?;
            copy_dir(&path, dest_root, source_root, ignores)?;
        } else if file_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WorkspaceErrorKind::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::copy(&path, &dest_path).map_err(|source| WorkspaceErrorKind::Copy {
                src: path.clone(),
                dst: dest_path.clone(),
                source,
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn copies_tree_and_skips_git_and_gcl() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        fs::create_dir_all(src.path().join(".gitlab-ci-local/builds")).unwrap();
        fs::write(src.path().join("Cargo.toml"), "[package]").unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::write(src.path().join("src/main.rs"), "fn main() {}").unwrap();

        let dest = tempfile::tempdir().unwrap();
        prepare_shell_workspace(src.path(), dest.path()).unwrap();

        assert!(dest.path().join("Cargo.toml").exists());
        assert!(dest.path().join("src/main.rs").exists());
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join(".gitlab-ci-local").exists());
    }

    #[test]
    fn honors_gitignore() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join(".gitignore"), "target/\n*.log\n").unwrap();
        fs::create_dir_all(src.path().join("target")).unwrap();
        fs::write(src.path().join("target/out"), "bin").unwrap();
        fs::write(src.path().join("debug.log"), "oops").unwrap();
        fs::write(src.path().join("keep.txt"), "kept").unwrap();

        let dest = tempfile::tempdir().unwrap();
        prepare_shell_workspace(src.path(), dest.path()).unwrap();

        assert!(!dest.path().join("target").exists());
        assert!(!dest.path().join("debug.log").exists());
        assert!(dest.path().join("keep.txt").exists());
    }
}
