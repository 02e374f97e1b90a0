//! Git metadata probe.
//!
//! The compiler needs a handful of facts about the working tree — commit,
//! branch, remote, author — to populate the predefined `CI_*` variables.
//! Everything here shells out to `git` via [`crate::process::spawn`].

use std::path::Path;

use thiserror::Error;

use crate::process::{spawn, SpawnError};

#[derive(Debug, Error)]
pub enum GitProbeErrorKind {
    #[error("not a git repository: {0}")]
    NotARepository(String),
    #[error("git command failed: {0}")]
    Command(#[from] SpawnError),
    #[error("could not parse git remote `{0}`")]
    UnparseableRemote(String),
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct GitProbeError(#[from] pub GitProbeErrorKind);

/// A project's `host/group/project` split out of its git remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParts {
    pub domain: String,
    pub group: String,
    pub project: String,
}

/// Everything the compiler reads out of the working tree's git metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInfo {
    pub user_name: String,
    pub user_email: String,
    pub branch: String,
    pub commit_sha: String,
    pub commit_short_sha: String,
    pub commit_title: String,
    pub commit_message: String,
    pub remote: Option<RemoteParts>,
}

/// Reads git metadata for the repository rooted at `cwd`.
///
/// Fatal: absent git metadata means the pipeline cannot be compiled, so
/// every failure here is propagated rather than defaulted.
pub fn probe(cwd: &Path) -> Result<GitInfo, GitProbeError> {
    let user_name = run(cwd, "git config user.name")
        .unwrap_or_else(|_| "local".to_string());
    let user_email = run(cwd, "git config user.email")
        .unwrap_or_else(|_| "local@localhost".to_string());

    let branch = run(cwd, "git rev-parse --abbrev-ref HEAD").map_err(|_| {
        GitProbeErrorKind::NotARepository(cwd.display().to_string())
    })?;
    let commit_sha = run(cwd, "git rev-parse HEAD")?;
    let commit_short_sha = run(cwd, "git rev-parse --short HEAD")?;
    let commit_title = run(cwd, "git log -1 --pretty=%s").unwrap_or_default();
    let commit_message = run(cwd, "git log -1 --pretty=%B").unwrap_or_default();

    let remote_url = run(cwd, "git config --get remote.origin.url").ok();
    let remote = remote_url.as_deref().map(parse_remote).transpose()?;

    Ok(GitInfo {
        user_name,
        user_email,
        branch,
        commit_sha,
        commit_short_sha,
        commit_title,
        commit_message,
        remote,
    })
}

fn run(cwd: &Path, command: &str) -> Result<String, GitProbeError> {
    let output = spawn(command, cwd, &Default::default())?;
    Ok(output.stdout.trim().to_string())
}

/// Parses both `git@host:group/project.git` and `https://host/group/project.git`
/// remotes. Intermediate path segments (nested groups) are folded into `group`.
fn parse_remote(url: &str) -> Result<RemoteParts, GitProbeError> {
    let trimmed = url.trim().trim_end_matches(".git");

    let (domain, path) = if let Some(rest) = trimmed.strip_prefix("git@") {
        rest.split_once(':')
            .ok_or_else(|| GitProbeErrorKind::UnparseableRemote(url.to_string()))?
    } else if let Some(rest) = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .or_else(|| trimmed.strip_prefix("ssh://git@"))
    {
        rest.split_once('/')
            .ok_or_else(|| GitProbeErrorKind::UnparseableRemote(url.to_string()))?
    } else {
        return Err(GitProbeErrorKind::UnparseableRemote(url.to_string()).into());
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(GitProbeErrorKind::UnparseableRemote(url.to_string()).into());
    }
    let project = segments.last().unwrap().to_string();
    let group = segments[..segments.len() - 1].join("/");

    Ok(RemoteParts {
        domain: domain.to_string(),
        group,
        project,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_remote() {
        let parts = parse_remote("git@gitlab.com:my-group/my-project.git").unwrap();
        assert_eq!(parts.domain, "gitlab.com");
        assert_eq!(parts.group, "my-group");
        assert_eq!(parts.project, "my-project");
    }

    #[test]
    fn parses_https_remote() {
        let parts = parse_remote("https://gitlab.com/parent/child/my-project.git").unwrap();
        assert_eq!(parts.domain, "gitlab.com");
        assert_eq!(parts.group, "parent/child");
        assert_eq!(parts.project, "my-project");
    }

    #[test]
    fn rejects_garbage_remote() {
        assert!(parse_remote("not-a-url").is_err());
    }
}
