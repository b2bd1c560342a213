//! Bounded retry loop with progressive timeouts and model-proposed fixes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{error, info, instrument, warn};

use crate::core::budget::TimeoutPolicy;
use crate::core::extract::fragments_in;
use crate::core::types::{CodeFragment, ExecutionResult, RetryAttempt};
use crate::dispatch::Execute;
use crate::io::completion::CompletionClient;
use crate::io::config::{HistoryRetention, RetryConfig};
use crate::io::history::ErrorHistory;
use crate::io::prompt::{FixContext, render_fix_prompt};

/// Reason why a retry session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStop {
    /// An attempt succeeded. `recovered` when it was not the first.
    Succeeded { recovered: bool },
    /// The last allowed attempt failed.
    AttemptsExhausted,
    /// The model round-trip failed.
    FixUnavailable { reason: String },
    /// The reply held no fragment in the original language.
    NoMatchingFix,
    /// Every matching fragment in the reply had already been run.
    RepeatedCode,
    /// The executor could not make the attempt.
    Infrastructure { reason: String },
}

/// Inputs of one retry session.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    /// The user's original request, quoted in fix prompts.
    pub goal: String,
    pub fragment: CodeFragment,
    pub max_attempts: u32,
    pub base_timeout: Duration,
}

/// Full record of a finished session. `final_result` is always set.
#[derive(Debug, Clone)]
pub struct RetrySession {
    pub fragment: CodeFragment,
    pub max_attempts: u32,
    pub base_timeout: Duration,
    pub attempts: Vec<RetryAttempt>,
    pub final_result: ExecutionResult,
    pub stop: RetryStop,
    /// Error-history file kept by the retention policy.
    pub history_path: Option<PathBuf>,
}

impl RetrySession {
    pub fn succeeded(&self) -> bool {
        matches!(self.stop, RetryStop::Succeeded { .. })
    }
}

/// Loop tuning independent of any single request.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub step: Duration,
    pub cap: Duration,
    pub history_dir: PathBuf,
    pub retention: HistoryRetention,
}

impl RetrySettings {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            step: Duration::from_secs(config.step_secs),
            cap: Duration::from_secs(config.cap_secs),
            history_dir: config.history_dir(),
            retention: config.retention,
        }
    }
}

pub struct RetryOrchestrator<'a, E: Execute> {
    executor: &'a E,
    settings: RetrySettings,
}

impl<'a, E: Execute> RetryOrchestrator<'a, E> {
    pub fn new(executor: &'a E, settings: RetrySettings) -> Self {
        Self { executor, settings }
    }

    /// Run the request and return only the final result.
    ///
    /// Fix prompts describe the fragment itself as the original request.
    pub fn run_with_retry<C: CompletionClient>(
        &self,
        fragment: CodeFragment,
        max_attempts: u32,
        base_timeout: Duration,
        fix: &C,
    ) -> Result<ExecutionResult> {
        let request = RetryRequest {
            goal: String::new(),
            fragment,
            max_attempts,
            base_timeout,
        };
        Ok(self.run(&request, fix)?.final_result)
    }

    /// Execute, and on failure ask `fix` for a replacement, until success or a stop condition.
    ///
    /// Attempts are strictly sequential. Errors are returned only for invalid
    /// input or when the error-history directory cannot be created.
    #[instrument(skip_all, fields(language = %request.fragment.language, max_attempts = request.max_attempts))]
    pub fn run<C: CompletionClient>(&self, request: &RetryRequest, fix: &C) -> Result<RetrySession> {
        if request.max_attempts == 0 {
            bail!("max_attempts must be >= 1");
        }
        let policy = TimeoutPolicy::new(request.base_timeout, self.settings.step, self.settings.cap);
        let history = ErrorHistory::create(&self.settings.history_dir, self.settings.retention)?;
        let history_path = history.path().to_string_lossy().into_owned();

        let goal = goal_or_fallback(request);
        let language = request.fragment.language.clone();
        let mut active = request.fragment.clone();
        let mut seen = HashSet::from([normalize_source(&active.source)]);
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut stop = RetryStop::AttemptsExhausted;

        for index in 0..request.max_attempts {
            let timeout = policy.timeout_for(index);
            info!(attempt = index + 1, timeout_secs = timeout.as_secs(), "starting attempt");
            let (result, infra_error) = match self.executor.execute(&active, timeout) {
                Ok(result) => (result, None),
                Err(err) => {
                    let reason = format!("{err:#}");
                    error!(attempt = index + 1, err = %reason, "attempt could not run");
                    (ExecutionResult::infrastructure(language.clone(), reason.clone()), Some(reason))
                }
            };
            let success = result.success;
            attempts.push(RetryAttempt {
                index,
                timeout_used: timeout,
                source: active.source.clone(),
                result,
                fix_prompt_sent: None,
                fix_response: None,
            });
            record_history(&history, &goal, &attempts);

            if let Some(reason) = infra_error {
                stop = RetryStop::Infrastructure { reason };
                break;
            }
            if success {
                let recovered = index > 0;
                if recovered {
                    info!(attempts = index + 1, "recovered after retries");
                }
                stop = RetryStop::Succeeded { recovered };
                break;
            }
            if index + 1 == request.max_attempts {
                warn!(attempts = index + 1, "attempts exhausted");
                stop = RetryStop::AttemptsExhausted;
                break;
            }

            let Some(last) = attempts.last_mut() else {
                break;
            };
            let prompt = render_fix_prompt(&FixContext {
                goal: &goal,
                source: &last.source,
                result: &last.result,
                attempt: index + 1,
                max_attempts: request.max_attempts,
                timeout_secs: timeout.as_secs(),
                next_timeout_secs: policy.timeout_for(index + 1).as_secs(),
                history_path: Some(&history_path),
            })?;
            last.fix_prompt_sent = Some(prompt.clone());

            let reply = match fix.complete(&prompt) {
                Ok(reply) => reply,
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(err = %reason, "fix request failed");
                    record_history(&history, &goal, &attempts);
                    stop = RetryStop::FixUnavailable { reason };
                    break;
                }
            };
            last.fix_response = Some(reply.clone());
            record_history(&history, &goal, &attempts);

            let candidates = fragments_in(&reply, &language);
            if candidates.is_empty() {
                warn!("fix reply contained no matching code block");
                stop = RetryStop::NoMatchingFix;
                break;
            }
            let Some(next) = candidates
                .into_iter()
                .find(|f| !seen.contains(&normalize_source(&f.source)))
            else {
                warn!("fix reply repeated code that already ran");
                stop = RetryStop::RepeatedCode;
                break;
            };
            seen.insert(normalize_source(&next.source));
            active = CodeFragment {
                language: language.clone(),
                source: next.source,
                origin_line: next.origin_line,
            };
        }

        let final_result = attempts
            .last()
            .map(|a| a.result.clone())
            .unwrap_or_else(|| ExecutionResult::not_attempted(language.clone()));
        let success = final_result.success;
        Ok(RetrySession {
            fragment: request.fragment.clone(),
            max_attempts: request.max_attempts,
            base_timeout: request.base_timeout,
            attempts,
            final_result,
            stop,
            history_path: history.finish(success),
        })
    }
}

fn record_history(history: &ErrorHistory, goal: &str, attempts: &[RetryAttempt]) {
    if let Err(err) = history.record(goal, attempts) {
        warn!(err = %format!("{err:#}"), "failed to write error history");
    }
}

/// The request's goal, or a description built from the fragment when none was given.
fn goal_or_fallback(request: &RetryRequest) -> String {
    if !request.goal.trim().is_empty() {
        return request.goal.clone();
    }
    format!(
        "Run this {} code successfully:\n{}",
        request.fragment.language,
        request.fragment.source.trim_end()
    )
}

/// Source compared modulo trailing whitespace on each line.
fn normalize_source(source: &str) -> String {
    source
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::language::Language;
    use crate::core::types::FailureKind;
    use crate::test_support::{ScriptedClient, ScriptedExecutor, failure, success};

    fn settings(dir: &std::path::Path) -> RetrySettings {
        RetrySettings {
            step: Duration::from_secs(90),
            cap: Duration::from_secs(300),
            history_dir: dir.to_path_buf(),
            retention: HistoryRetention::DeleteOnSuccess,
        }
    }

    fn request(source: &str, max_attempts: u32) -> RetryRequest {
        RetryRequest {
            goal: "compute".to_string(),
            fragment: CodeFragment::new(Language::Python, source),
            max_attempts,
            base_timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn run_with_retry_prompt_describes_the_fragment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            Ok(failure(Language::Python, "NameError: name 'x' is not defined")),
            Ok(success(Language::Python, "1\n")),
        ]);
        let client = ScriptedClient::new(vec![Ok("```python\nprint(1)\n```".to_string())]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let result = orchestrator
            .run_with_retry(
                CodeFragment::new(Language::Python, "print(x)"),
                2,
                Duration::from_secs(10),
                &client,
            )
            .expect("run");

        assert!(result.success);
        let prompts = client.prompts();
        assert_eq!(prompts.len(), 1);
        let request_section = prompts[0]
            .split("ORIGINAL USER REQUEST:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\n").next())
            .expect("request section");
        assert!(request_section.contains("Run this python code successfully"), "{request_section}");
        assert!(request_section.contains("print(x)"), "{request_section}");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(Vec::new());
        let client = ScriptedClient::new(Vec::new());
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        assert!(orchestrator.run(&request("print(1)", 0), &client).is_err());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn timeouts_grow_per_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            Ok(failure(Language::Python, "e1")),
            Ok(failure(Language::Python, "e2")),
            Ok(failure(Language::Python, "e3")),
        ]);
        let client = ScriptedClient::new(vec![
            Ok("```python\nprint(2)\n```".to_string()),
            Ok("```python\nprint(3)\n```".to_string()),
        ]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");

        let timeouts: Vec<u64> = executor.calls().iter().map(|(_, t)| t.as_secs()).collect();
        assert_eq!(timeouts, vec![120, 210, 300]);
        assert_eq!(session.stop, RetryStop::AttemptsExhausted);
        assert_eq!(session.final_result.stderr, "e3");
        assert_eq!(client.prompts().len(), 2);
        assert!(session.history_path.is_some());
    }

    #[test]
    fn fix_failure_stops_with_last_execution_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![Ok(failure(Language::Python, "boom"))]);
        let client = ScriptedClient::new(vec![Err(anyhow::anyhow!("model unreachable"))]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");

        assert!(matches!(session.stop, RetryStop::FixUnavailable { ref reason } if reason.contains("unreachable")));
        assert_eq!(session.final_result.stderr, "boom");
        assert_eq!(session.attempts.len(), 1);
        assert!(session.attempts[0].fix_prompt_sent.is_some());
        assert!(session.attempts[0].fix_response.is_none());
    }

    #[test]
    fn reply_without_matching_language_stops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![Ok(failure(Language::Python, "boom"))]);
        let client = ScriptedClient::new(vec![Ok("try this:\n```bash\necho 1\n```".to_string())]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");
        assert_eq!(session.stop, RetryStop::NoMatchingFix);
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn identical_code_is_never_rerun() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![Ok(failure(Language::Python, "boom"))]);
        let client = ScriptedClient::new(vec![Ok("```python\nprint(1)  \n```".to_string())]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");
        assert_eq!(session.stop, RetryStop::RepeatedCode);
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn first_unseen_matching_fragment_is_chosen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            Ok(failure(Language::Python, "boom")),
            Ok(success(Language::Python, "2\n")),
        ]);
        let reply = "```sh\nls\n```\n```python\nprint(1)\n```\n```python\nprint(2)\n```\n";
        let client = ScriptedClient::new(vec![Ok(reply.to_string())]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");
        assert_eq!(session.stop, RetryStop::Succeeded { recovered: true });
        assert_eq!(executor.calls()[1].0, "print(2)");
        assert!(session.history_path.is_none(), "history deleted on success");
    }

    #[test]
    fn executor_error_becomes_infrastructure_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![Err(anyhow::anyhow!("disk full"))]);
        let client = ScriptedClient::new(Vec::new());
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 3), &client).expect("run");
        assert!(matches!(session.stop, RetryStop::Infrastructure { .. }));
        assert_eq!(session.final_result.failure, Some(FailureKind::Infrastructure));
        assert_eq!(session.attempts.len(), 1);
        assert!(client.prompts().is_empty());
    }

    #[test]
    fn fix_prompt_references_history_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![Ok(failure(Language::Python, "boom"))]);
        let client = ScriptedClient::new(vec![Ok("no code today".to_string())]);
        let orchestrator = RetryOrchestrator::new(&executor, settings(temp.path()));
        let session = orchestrator.run(&request("print(1)", 2), &client).expect("run");
        let history = session.history_path.expect("kept on failure");
        let prompt = &client.prompts()[0];
        assert!(prompt.contains(&history.to_string_lossy().into_owned()));
        let text = std::fs::read_to_string(&history).expect("read history");
        assert!(text.contains("no code today"));
    }
}
