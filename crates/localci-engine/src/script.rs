//! Phase 3 — script composition.
//!
//! Builds the single init script a job's shell runs: strict mode, stdin
//! closed, variables exported, then each source line echoed (so the log
//! reads like an interactive session) before it executes.

use std::collections::BTreeMap;

/// Builds the script body for one phase (`before_script`+`script`, or
/// `after_script`). `variables` is only exported in shell mode — container
/// mode injects them via `-e` at container-create time instead.
#[must_use]
pub fn compose(lines: &[String], variables: Option<&BTreeMap<String, String>>) -> String {
    let mut out = String::from("set -eo pipefail\nexec 0</dev/null\n");

    if let Some(vars) = variables {
        for (k, v) in vars {
            out.push_str(&format!("export {k}={}\n", shell_words::quote(v)));
        }
    }

    for line in lines {
        for (i, source_line) in line.lines().enumerate() {
            if i == 0 {
                let note = if line.lines().count() > 1 { " # collapsed multi-line command" } else { "" };
                out.push_str(&format!("echo '$ {}'{}\n", escape_single_quotes(source_line), note));
            }
        }
        out.push_str(line);
        out.push('\n');
    }

    out.push_str("exit 0\n");
    out
}

fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', "'\\''")
}
