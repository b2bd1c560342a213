//! Per-session error-history file referenced from fix prompts.
//!
//! Each retry session owns one file, rewritten after every attempt and fix
//! round-trip. It is a product artifact: written regardless of `RUST_LOG`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, warn};

use crate::core::types::RetryAttempt;
use crate::io::config::HistoryRetention;
use crate::io::write_atomic;

static SESSION_SEQ: AtomicU32 = AtomicU32::new(0);

#[derive(Debug)]
pub struct ErrorHistory {
    path: PathBuf,
    retention: HistoryRetention,
}

impl ErrorHistory {
    /// Reserve a unique history path under `dir`. Nothing is written yet.
    pub fn create(dir: &Path, retention: HistoryRetention) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create history dir {}", dir.display()))?;
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "session_{}_{}_{seq}_errors.md",
            Local::now().format("%Y%m%d_%H%M%S"),
            std::process::id()
        );
        Ok(Self {
            path: dir.join(name),
            retention,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with every attempt so far.
    pub fn record(&self, goal: &str, attempts: &[RetryAttempt]) -> Result<()> {
        write_atomic(&self.path, &render_history(goal, attempts))
            .with_context(|| format!("write error history {}", self.path.display()))
    }

    /// Apply the retention policy. Returns the path if the file is kept.
    pub fn finish(self, success: bool) -> Option<PathBuf> {
        let delete = match self.retention {
            HistoryRetention::DeleteOnSuccess => success,
            HistoryRetention::Keep => false,
            HistoryRetention::Delete => true,
        };
        if !delete {
            return self.path.exists().then_some(self.path);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed error history"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), err = %e, "failed to remove error history"),
        }
        None
    }
}

fn render_history(goal: &str, attempts: &[RetryAttempt]) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "# Error history\n");
    let _ = writeln!(buf, "Goal: {}\n", goal.trim());
    for attempt in attempts {
        let result = &attempt.result;
        let _ = writeln!(buf, "## Attempt {}\n", attempt.index + 1);
        let _ = writeln!(buf, "- language: {}", result.language);
        let _ = writeln!(buf, "- timeout: {}s", attempt.timeout_used.as_secs());
        let _ = writeln!(buf, "- exit code: {}", result.exit_code);
        let _ = writeln!(buf, "- duration: {:.2}s", result.duration.as_secs_f64());
        let _ = writeln!(buf, "- timed out: {}", result.timed_out);
        if let Some(kind) = result.failure {
            let _ = writeln!(buf, "- failure: {}", kind.as_str());
        }
        buf.push_str("\n=== code ===\n");
        buf.push_str(&attempt.source);
        buf.push_str("\n=== stdout ===\n");
        buf.push_str(&result.stdout);
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&result.stderr);
        buf.push('\n');
        if let Some(response) = &attempt.fix_response {
            buf.push_str("\n=== fix response ===\n");
            buf.push_str(response);
            buf.push('\n');
        } else if attempt.fix_prompt_sent.is_some() {
            buf.push_str("\n[fix requested, no response]\n");
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::language::Language;
    use crate::core::types::{ExecutionResult, FailureKind};

    fn attempt(index: u32, stderr: &str) -> RetryAttempt {
        RetryAttempt {
            index,
            timeout_used: Duration::from_secs(120),
            source: "print(1/0)".to_string(),
            result: ExecutionResult::failed(
                Language::Python,
                FailureKind::ExecutionFailure,
                1,
                String::new(),
                stderr.to_string(),
                Duration::from_millis(40),
            ),
            fix_prompt_sent: Some("fix it".to_string()),
            fix_response: Some("```python\nprint(1)\n```".to_string()),
        }
    }

    #[test]
    fn record_lists_every_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = ErrorHistory::create(temp.path(), HistoryRetention::Keep).expect("create");
        history
            .record("divide", &[attempt(0, "ZeroDivisionError"), attempt(1, "NameError")])
            .expect("record");
        let text = fs::read_to_string(history.path()).expect("read");
        assert!(text.contains("## Attempt 1"));
        assert!(text.contains("## Attempt 2"));
        assert!(text.contains("ZeroDivisionError"));
        assert!(text.contains("- failure: execution_failure"));
        assert!(text.contains("=== fix response ==="));
    }

    #[test]
    fn default_retention_deletes_on_success_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kept = ErrorHistory::create(temp.path(), HistoryRetention::DeleteOnSuccess).expect("create");
        kept.record("g", &[attempt(0, "boom")]).expect("record");
        let path = kept.finish(false).expect("kept on failure");
        assert!(path.exists());

        let removed = ErrorHistory::create(temp.path(), HistoryRetention::DeleteOnSuccess).expect("create");
        removed.record("g", &[attempt(0, "boom")]).expect("record");
        let removed_path = removed.path().to_path_buf();
        assert!(removed.finish(true).is_none());
        assert!(!removed_path.exists());
    }

    #[test]
    fn sessions_get_distinct_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = ErrorHistory::create(temp.path(), HistoryRetention::Keep).expect("a");
        let b = ErrorHistory::create(temp.path(), HistoryRetention::Keep).expect("b");
        assert_ne!(a.path(), b.path());
    }
}
