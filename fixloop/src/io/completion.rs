//! Model round-trip used to request fixes.
//!
//! The [`CompletionClient`] trait decouples the retry loop from the model
//! backend. [`CommandClient`] pipes the prompt into a CLI (for example a model
//! CLI in print mode); tests use closures or scripted clients.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::RetryConfig;
use crate::io::process::{isolated_command, run_command_with_timeout};

pub trait CompletionClient {
    /// Send `prompt` and return the model's full text reply.
    fn complete(&self, prompt: &str) -> Result<String>;
}

impl<F: Fn(&str) -> Result<String>> CompletionClient for F {
    fn complete(&self, prompt: &str) -> Result<String> {
        self(prompt)
    }
}

/// Client that runs a command with the prompt on stdin and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandClient {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandClient {
    pub fn new(
        argv: Vec<String>,
        env: BTreeMap<String, String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!("fix command must be a non-empty array"));
        }
        Ok(Self {
            argv,
            env,
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(
        config: &RetryConfig,
        env: BTreeMap<String, String>,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        Self::new(
            config.fix_command.clone(),
            env,
            Duration::from_secs(config.fix_timeout_secs),
            output_limit_bytes,
        )
    }
}

impl CompletionClient for CommandClient {
    #[instrument(skip_all, fields(program = %self.argv[0], timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        info!(prompt_bytes = prompt.len(), "requesting fix");
        let mut cmd = isolated_command(&self.argv[0], &self.env);
        cmd.args(&self.argv[1..]);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run fix command {}", self.argv[0]))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "fix command timed out");
            return Err(anyhow!("fix command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "fix command failed");
            return Err(anyhow!(
                "fix command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        let reply = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(reply_bytes = reply.len(), "fix command completed");
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())])
    }

    fn client(script: &str) -> CommandClient {
        CommandClient::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env(),
            Duration::from_secs(10),
            10_000,
        )
        .expect("client")
    }

    #[test]
    fn prompt_goes_to_stdin_and_stdout_comes_back() {
        let reply = client("printf 'got: '; cat").complete("fix me").expect("complete");
        assert_eq!(reply, "got: fix me");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = client("echo offline >&2; exit 7").complete("p").expect_err("should fail");
        assert!(format!("{err:#}").contains("offline"), "{err:#}");
    }

    #[test]
    fn closures_are_clients() {
        let echo = |prompt: &str| -> Result<String> { Ok(prompt.to_uppercase()) };
        assert_eq!(echo.complete("abc").expect("complete"), "ABC");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandClient::new(Vec::new(), env(), Duration::from_secs(1), 10).is_err());
    }
}
