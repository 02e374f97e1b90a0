//! Output Sink: per-job colorized streams plus a mirrored on-disk log.
//!
//! Writes are serialized through a single mutex so interleaved job output
//! from concurrent jobs never tears a line.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkErrorKind {
    #[error("failed to open log file {path}: {source}")]
    OpenLog { path: PathBuf, source: std::io::Error },
    #[error("failed to write log file {path}: {source}")]
    WriteLog { path: PathBuf, source: std::io::Error },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct SinkError(#[from] pub SinkErrorKind);

/// Where a job's output goes: stdout/stderr with color markup, and a
/// mirrored plain-text copy on disk.
pub trait Sink: Send + Sync {
    fn line(&self, job_name: &str, is_stderr: bool, text: &str);
}

const BLUE: &str = "\x1b[34m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Writes colorized, job-name-prefixed lines to stdout/stderr and appends
/// the same lines (uncolored) to `.gitlab-ci-local/output/<safe-name>.log`.
pub struct ConsoleSink {
    log_file: Mutex<File>,
    name_width: usize,
}

impl ConsoleSink {
    pub fn create(log_path: &Path, name_width: usize) -> Result<Self, SinkError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SinkErrorKind::OpenLog {
                path: log_path.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(log_path).map_err(|source| SinkErrorKind::OpenLog {
            path: log_path.to_path_buf(),
            source,
        })?;
        Ok(Self { log_file: Mutex::new(file), name_width })
    }
}

impl Sink for ConsoleSink {
    fn line(&self, job_name: &str, is_stderr: bool, text: &str) {
        if text.is_empty() {
            return;
        }
        let padded = format!("{job_name:<width$}", width = self.name_width);
        let marker = if text.starts_with('$') {
            ""
        } else if is_stderr {
            "red"
        } else {
            "green"
        };
        let color = match marker {
            "red" => RED,
            "green" => GREEN,
            _ => "",
        };
        let prefix = if marker.is_empty() { String::new() } else { format!("{color}>{RESET} ") };

        let mut guard = self.log_file.lock().expect("sink log mutex poisoned");
        println!("{BLUE}{padded}{RESET} {prefix}{text}");
        let _ = writeln!(guard, "{padded} {text}");
    }
}

/// Collects lines in memory, for tests.
#[derive(Default)]
pub struct MockSink {
    pub lines: Mutex<Vec<(String, bool, String)>>,
}

impl Sink for MockSink {
    fn line(&self, job_name: &str, is_stderr: bool, text: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((job_name.to_string(), is_stderr, text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_sink_records_lines_in_order() {
        let sink = MockSink::default();
        sink.line("build", false, "compiling");
        sink.line("build", true, "warning: unused");
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], ("build".to_string(), false, "compiling".to_string()));
    }

    #[test]
    fn console_sink_mirrors_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("output/build.log");
        let sink = ConsoleSink::create(&log_path, 10).unwrap();
        sink.line("build", false, "hello from job");

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("hello from job"));
    }
}
