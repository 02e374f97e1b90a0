//! Subprocess spawning.
//!
//! The rest of the crate never touches [`std::process::Command`] directly;
//! every external command — git, docker, the job's own shell — goes through
//! [`spawn`] so output capture and error shape stay uniform.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct SpawnOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code. `None` if the child was killed by a signal.
    pub exit_code: Option<i32>,
}

impl SpawnOutput {
    /// Returns true if the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined stdout+stderr, stdout first, for error messages.
    #[must_use]
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnErrorKind {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {code}: {output}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: String,
    },
    #[error("`{command}` terminated by signal: {output}")]
    Signaled { command: String, output: String },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct SpawnError(#[from] pub SpawnErrorKind);

/// A small delay after the child exits, letting OS-buffered pipes flush
/// before the reader threads are joined.
const DRAIN_DELAY: Duration = Duration::from_millis(10);

/// Runs `command` through `sh -c`, capturing both output streams fully.
///
/// Returns `Err` when the process could not be launched or exited non-zero;
/// use [`spawn_allow_failure`] when the caller wants to inspect the exit
/// code itself (e.g. the job engine, which distinguishes `allow_failure`).
pub fn spawn(command: &str, cwd: &Path, env: &HashMap<String, String>) -> Result<SpawnOutput, SpawnError> {
    let output = spawn_allow_failure(command, cwd, env)?;
    if output.success() {
        Ok(output)
    } else {
        Err(SpawnErrorKind::NonZeroExit {
            command: command.to_string(),
            code: output.exit_code.unwrap_or(-1),
            output: output.combined(),
        }
        .into())
    }
}

/// Like [`spawn`] but never converts a non-zero exit into an error; only
/// launch failures are errors. Used by job execution, where the exit code
/// is part of normal control flow (`allow_failure`, rule gating).
pub fn spawn_allow_failure(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<SpawnOutput, SpawnError> {
    tracing::debug!(command, cwd = %cwd.display(), "spawning process");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| SpawnErrorKind::Launch {
        command: command.to_string(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stdout_handle = thread::spawn(move || -> std::io::Result<String> {
        use std::io::Read;
        let mut buf = String::new();
        let mut reader = stdout;
        reader.read_to_string(&mut buf)?;
        Ok(buf)
    });
    let stderr_handle = thread::spawn(move || -> std::io::Result<String> {
        use std::io::Read;
        let mut buf = String::new();
        let mut reader = stderr;
        reader.read_to_string(&mut buf)?;
        Ok(buf)
    });

    let status = child.wait().map_err(|source| SpawnErrorKind::Launch {
        command: command.to_string(),
        source,
    })?;
    thread::sleep(DRAIN_DELAY);

    let stdout = stdout_handle.join().ok().and_then(Result::ok).unwrap_or_default();
    let stderr = stderr_handle.join().ok().and_then(Result::ok).unwrap_or_default();

    Ok(SpawnOutput {
        stdout,
        stderr,
        exit_code: status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        std::env::current_dir().unwrap()
    }

    #[test]
    fn captures_stdout() {
        let out = spawn("echo hello", &cwd(), &HashMap::new()).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.success());
    }

    #[test]
    fn non_zero_exit_is_error() {
        let err = spawn("exit 3", &cwd(), &HashMap::new()).unwrap_err();
        assert!(matches!(err.0, SpawnErrorKind::NonZeroExit { code: 3, .. }));
    }

    #[test]
    fn allow_failure_surfaces_exit_code() {
        let out = spawn_allow_failure("exit 7", &cwd(), &HashMap::new()).unwrap();
        assert_eq!(out.exit_code, Some(7));
        assert!(!out.success());
    }

    #[test]
    fn env_vars_are_visible() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let out = spawn("echo $FOO", &cwd(), &env).unwrap();
        assert_eq!(out.stdout.trim(), "bar");
    }
}
