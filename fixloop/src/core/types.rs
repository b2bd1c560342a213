//! Shared data model for execution, retry sessions, and deployments.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::language::Language;

/// Exit code reported when no process exit status exists (never spawned, killed, synthetic).
pub const NO_EXIT_CODE: i32 = -1;

/// File inside a deployment directory that receives the server's stdout and stderr.
pub const SERVER_LOG: &str = "server.log";

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The process ran and exited non-zero.
    ExecutionFailure,
    /// The wall-clock timeout expired and the process was killed.
    Timeout,
    UnsupportedLanguage,
    /// The interpreter or device bridge could not be reached.
    BackendUnavailable,
    /// The engine itself failed before or while running the attempt.
    Infrastructure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionFailure => "execution_failure",
            Self::Timeout => "timeout",
            Self::UnsupportedLanguage => "unsupported_language",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// Normalized outcome of running one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub language: Language,
    pub duration: Duration,
    pub timed_out: bool,
    /// `None` exactly when `success` is true.
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    pub fn succeeded(language: Language, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_code: 0,
            language,
            duration,
            timed_out: false,
            failure: None,
        }
    }

    pub fn failed(
        language: Language,
        kind: FailureKind,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code,
            language,
            duration,
            timed_out: kind == FailureKind::Timeout,
            failure: Some(kind),
        }
    }

    pub fn unsupported(language: Language) -> Self {
        let stderr = format!("Unsupported language: {}", language.requested_tag());
        Self::failed(
            language,
            FailureKind::UnsupportedLanguage,
            NO_EXIT_CODE,
            String::new(),
            stderr,
            Duration::ZERO,
        )
    }

    pub fn backend_unavailable(language: Language, message: impl Into<String>, duration: Duration) -> Self {
        Self::failed(
            language,
            FailureKind::BackendUnavailable,
            NO_EXIT_CODE,
            String::new(),
            message.into(),
            duration,
        )
    }

    pub fn infrastructure(language: Language, message: impl Into<String>) -> Self {
        Self::failed(
            language,
            FailureKind::Infrastructure,
            NO_EXIT_CODE,
            String::new(),
            message.into(),
            Duration::ZERO,
        )
    }

    /// Placeholder result for a session that ended before any execution.
    pub fn not_attempted(language: Language) -> Self {
        Self::failed(
            language,
            FailureKind::Infrastructure,
            NO_EXIT_CODE,
            String::new(),
            "No execution attempted".to_string(),
            Duration::ZERO,
        )
    }
}

/// One fenced code block lifted out of model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeFragment {
    pub language: Language,
    pub source: String,
    /// 1-based line of the opening fence in the text it came from.
    pub origin_line: usize,
}

impl CodeFragment {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            origin_line: 1,
        }
    }
}

/// One loop iteration of a retry session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 0-based.
    pub index: u32,
    pub timeout_used: Duration,
    pub source: String,
    pub result: ExecutionResult,
    pub fix_prompt_sent: Option<String>,
    pub fix_response: Option<String>,
}

/// Monotonic, timestamp-derived deployment identifier (milliseconds since the epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeploymentId(pub u64);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
    Static,
    DynamicBackend,
}

impl ServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::DynamicBackend => "dynamic-backend",
        }
    }
}

/// A detached server launched and tracked by the deployment manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub directory: PathBuf,
    pub port: u16,
    pub process_id: u32,
    pub process_group_id: u32,
    pub server_kind: ServerKind,
    pub started_at: DateTime<Utc>,
}

impl Deployment {
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn log_path(&self) -> PathBuf {
        self.directory.join(SERVER_LOG)
    }
}
