//! Language dispatch: one execution strategy per canonical language.
//!
//! [`LanguageDispatcher`] is a registration map from [`Language`] to a
//! [`Strategy`]. Adding a language means registering a strategy; unsupported
//! tags never reach a strategy and never spawn a process.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::language::Language;
use crate::core::types::{CodeFragment, ExecutionResult, FailureKind, NO_EXIT_CODE};
use crate::io::config::EngineConfig;
use crate::io::deploy::{DeployContent, DeploymentManager, LaunchOutcome};
use crate::io::device::DeviceBridge;
use crate::io::process::{CommandOutput, SpawnError, isolated_command, run_command_with_timeout};

const DEVICE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that runs a fragment under a hard timeout.
///
/// Execution failures come back as `Ok` results with `success == false`.
/// `Err` means the attempt could not even be made.
pub trait Execute {
    fn execute(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult>;
}

/// How one language is executed.
pub trait Strategy: Send + Sync {
    fn run(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult>;
}

#[derive(Default)]
pub struct LanguageDispatcher {
    strategies: HashMap<Language, Box<dyn Strategy>>,
}

impl LanguageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with every supported language wired to its default backend.
    pub fn from_config(
        config: &EngineConfig,
        env: BTreeMap<String, String>,
        deployments: Arc<DeploymentManager>,
        bridge: Arc<dyn DeviceBridge>,
    ) -> Self {
        let exec = &config.execution;
        let limit = exec.output_limit_bytes;
        let mut dispatcher = Self::new();
        dispatcher
            .register(
                Language::Python,
                LocalInterpreter::new(Language::Python, &exec.python, SourceMode::Argument("-c"), env.clone(), limit),
            )
            .register(
                Language::Javascript,
                LocalInterpreter::new(Language::Javascript, &exec.node, SourceMode::Argument("-e"), env.clone(), limit),
            )
            .register(
                Language::Shell,
                LocalInterpreter::new(Language::Shell, &exec.shell, SourceMode::ScriptFile(".sh"), env, limit),
            )
            .register(
                Language::Android,
                DeviceStrategy::new(Language::Android, Arc::clone(&bridge), false, &config.device.remote_dir),
            )
            .register(
                Language::AndroidRoot,
                DeviceStrategy::new(Language::AndroidRoot, bridge, true, &config.device.remote_dir),
            )
            .register(Language::Html, ServerStrategy::new(deployments));
        dispatcher
    }

    pub fn register(&mut self, language: Language, strategy: impl Strategy + 'static) -> &mut Self {
        self.strategies.insert(language, Box::new(strategy));
        self
    }

    pub fn supports(&self, language: &Language) -> bool {
        self.strategies.contains_key(language)
    }
}

impl Execute for LanguageDispatcher {
    #[instrument(skip_all, fields(language = %fragment.language, timeout_secs = timeout.as_secs()))]
    fn execute(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult> {
        let Some(strategy) = self.strategies.get(&fragment.language) else {
            warn!(tag = fragment.language.requested_tag(), "no strategy for language");
            return Ok(ExecutionResult::unsupported(fragment.language.clone()));
        };
        let result = strategy.run(fragment, timeout)?;
        debug!(
            success = result.success,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "fragment executed"
        );
        Ok(result)
    }
}

/// How source reaches the interpreter.
#[derive(Debug, Clone, Copy)]
pub enum SourceMode {
    /// Passed inline after the given flag (`python3 -c SRC`).
    Argument(&'static str),
    /// Written to a temporary script with the given suffix, removed after the run.
    ScriptFile(&'static str),
}

/// Runs fragments with a host interpreter.
pub struct LocalInterpreter {
    language: Language,
    program: String,
    mode: SourceMode,
    env: BTreeMap<String, String>,
    output_limit_bytes: usize,
}

impl LocalInterpreter {
    pub fn new(
        language: Language,
        program: &str,
        mode: SourceMode,
        env: BTreeMap<String, String>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            language,
            program: program.to_string(),
            mode,
            env,
            output_limit_bytes,
        }
    }
}

impl Strategy for LocalInterpreter {
    fn run(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult> {
        let mut cmd = isolated_command(&self.program, &self.env);
        let _script = match self.mode {
            SourceMode::Argument(flag) => {
                cmd.arg(flag).arg(&fragment.source);
                None
            }
            SourceMode::ScriptFile(suffix) => {
                let script = tempfile::Builder::new()
                    .prefix("fixloop_")
                    .suffix(suffix)
                    .tempfile()
                    .context("create script file")?;
                fs::write(script.path(), &fragment.source)
                    .with_context(|| format!("write script {}", script.path().display()))?;
                cmd.arg(script.path());
                Some(script)
            }
        };

        match run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes) {
            Ok(output) => Ok(result_from_output(self.language.clone(), &output, timeout)),
            Err(err) => match err.downcast_ref::<SpawnError>() {
                Some(spawn) => Ok(ExecutionResult::backend_unavailable(
                    self.language.clone(),
                    spawn.to_string(),
                    Duration::ZERO,
                )),
                None => Err(err),
            },
        }
    }
}

fn result_from_output(language: Language, output: &CommandOutput, timeout: Duration) -> ExecutionResult {
    let stdout = output.stdout_text();
    let mut stderr = output.stderr_text();
    if output.timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&timeout_message(timeout));
        return ExecutionResult::failed(language, FailureKind::Timeout, NO_EXIT_CODE, stdout, stderr, output.elapsed);
    }
    if output.status.success() {
        return ExecutionResult::succeeded(language, stdout, stderr, output.elapsed);
    }
    ExecutionResult::failed(
        language,
        FailureKind::ExecutionFailure,
        output.exit_code(),
        stdout,
        stderr,
        output.elapsed,
    )
}

fn timeout_message(timeout: Duration) -> String {
    format!("Execution timed out after {} seconds", timeout.as_secs_f64())
}

static REMOTE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Runs fragments in a device shell through a [`DeviceBridge`].
pub struct DeviceStrategy {
    language: Language,
    bridge: Arc<dyn DeviceBridge>,
    elevated: bool,
    remote_dir: String,
}

impl DeviceStrategy {
    pub fn new(language: Language, bridge: Arc<dyn DeviceBridge>, elevated: bool, remote_dir: &str) -> Self {
        Self {
            language,
            bridge,
            elevated,
            remote_dir: remote_dir.trim_end_matches('/').to_string(),
        }
    }

    fn unavailable(&self, message: String, started: Instant) -> ExecutionResult {
        warn!(%message, "device backend unavailable");
        ExecutionResult::backend_unavailable(self.language.clone(), message, started.elapsed())
    }
}

impl Strategy for DeviceStrategy {
    #[instrument(skip_all, fields(elevated = self.elevated))]
    fn run(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult> {
        let started = Instant::now();
        match self.bridge.is_connected() {
            Ok(true) => {}
            Ok(false) => return Ok(self.unavailable("No Android device connected".to_string(), started)),
            Err(err) => return Ok(self.unavailable(format!("device bridge unavailable: {err:#}"), started)),
        }

        let script = tempfile::Builder::new()
            .prefix("fixloop_")
            .suffix(".sh")
            .tempfile()
            .context("create device script")?;
        fs::write(script.path(), &fragment.source)
            .with_context(|| format!("write device script {}", script.path().display()))?;
        let remote = format!(
            "{}/fixloop_{}_{}.sh",
            self.remote_dir,
            std::process::id(),
            REMOTE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        if let Err(err) = self.bridge.push(script.path(), &remote) {
            return Ok(self.unavailable(format!("push to device failed: {err:#}"), started));
        }

        let output = self.bridge.shell(&format!("sh {remote}"), self.elevated, timeout);
        if let Err(err) = self
            .bridge
            .shell(&format!("rm -f {remote}"), self.elevated, DEVICE_CLEANUP_TIMEOUT)
        {
            warn!(err = %format!("{err:#}"), %remote, "failed to remove device script");
        }

        let output = match output {
            Ok(output) => output,
            Err(err) => return Ok(self.unavailable(format!("device shell failed: {err:#}"), started)),
        };
        let elapsed = started.elapsed();
        let language = self.language.clone();
        if output.timed_out {
            let mut stderr = output.stderr;
            stderr.push_str(&timeout_message(timeout));
            return Ok(ExecutionResult::failed(
                language,
                FailureKind::Timeout,
                NO_EXIT_CODE,
                output.stdout,
                stderr,
                elapsed,
            ));
        }
        if output.exit_code == 0 {
            return Ok(ExecutionResult::succeeded(language, output.stdout, output.stderr, elapsed));
        }
        Ok(ExecutionResult::failed(
            language,
            FailureKind::ExecutionFailure,
            output.exit_code,
            output.stdout,
            output.stderr,
            elapsed,
        ))
    }
}

/// Hands html fragments to the deployment manager.
///
/// The timeout does not apply: the server is detached and only the liveness
/// window blocks the caller.
pub struct ServerStrategy {
    deployments: Arc<DeploymentManager>,
}

impl ServerStrategy {
    pub fn new(deployments: Arc<DeploymentManager>) -> Self {
        Self { deployments }
    }
}

impl Strategy for ServerStrategy {
    fn run(&self, fragment: &CodeFragment, _timeout: Duration) -> Result<ExecutionResult> {
        let started = Instant::now();
        let content = DeployContent::document(fragment.source.clone());
        match self.deployments.deploy(&content)? {
            LaunchOutcome::Serving {
                deployment,
                responding,
            } => {
                let stdout = format!(
                    "Web server started at {}\nServer PID: {}\nFiles served from: {}\nDeployment id: {}\n",
                    deployment.url(),
                    deployment.process_id,
                    deployment.directory.display(),
                    deployment.id,
                );
                let stderr = if responding {
                    String::new()
                } else {
                    "Server is running but did not answer HTTP probes yet\n".to_string()
                };
                Ok(ExecutionResult::succeeded(
                    fragment.language.clone(),
                    stdout,
                    stderr,
                    started.elapsed(),
                ))
            }
            LaunchOutcome::Exited {
                port,
                exit_code,
                log,
            } => Ok(ExecutionResult::failed(
                fragment.language.clone(),
                FailureKind::ExecutionFailure,
                exit_code,
                String::new(),
                format!("Server failed to start on port {port}: {}", log.trim_end()),
                started.elapsed(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::{FakeDeviceBridge, test_env};

    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl Strategy for Recording {
        fn run(&self, fragment: &CodeFragment, _timeout: Duration) -> Result<ExecutionResult> {
            self.calls
                .lock()
                .expect("lock")
                .push(fragment.source.clone());
            Ok(ExecutionResult::succeeded(
                fragment.language.clone(),
                "ok".to_string(),
                String::new(),
                Duration::ZERO,
            ))
        }
    }

    #[test]
    fn unsupported_language_never_reaches_a_strategy() {
        let mut dispatcher = LanguageDispatcher::new();
        dispatcher.register(
            Language::Python,
            Recording {
                calls: Mutex::new(Vec::new()),
            },
        );
        let fragment = CodeFragment::new(Language::from_tag("ruby"), "puts 1");
        let result = dispatcher
            .execute(&fragment, Duration::from_secs(1))
            .expect("execute");
        assert!(!result.success);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_eq!(result.failure, Some(FailureKind::UnsupportedLanguage));
        assert!(!dispatcher.supports(&fragment.language));
    }

    #[test]
    fn registered_strategy_receives_fragment() {
        let mut dispatcher = LanguageDispatcher::new();
        dispatcher.register(
            Language::Shell,
            Recording {
                calls: Mutex::new(Vec::new()),
            },
        );
        let fragment = CodeFragment::new(Language::from_tag("bash"), "echo hi");
        let result = dispatcher
            .execute(&fragment, Duration::from_secs(1))
            .expect("execute");
        assert!(result.success);
    }

    #[cfg(unix)]
    #[test]
    fn shell_script_runs_and_reports_exit_code() {
        let shell = LocalInterpreter::new(Language::Shell, "/bin/sh", SourceMode::ScriptFile(".sh"), test_env(), 10_000);
        let ok = shell
            .run(&CodeFragment::new(Language::Shell, "echo hello"), Duration::from_secs(10))
            .expect("run");
        assert!(ok.success);
        assert_eq!(ok.stdout, "hello\n");

        let failed = shell
            .run(&CodeFragment::new(Language::Shell, "echo bad >&2; exit 4"), Duration::from_secs(10))
            .expect("run");
        assert_eq!(failed.failure, Some(FailureKind::ExecutionFailure));
        assert_eq!(failed.exit_code, 4);
        assert_eq!(failed.stderr, "bad\n");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_distinct_from_non_zero_exit() {
        let shell = LocalInterpreter::new(Language::Shell, "/bin/sh", SourceMode::ScriptFile(".sh"), test_env(), 10_000);
        let result = shell
            .run(&CodeFragment::new(Language::Shell, "sleep 30"), Duration::from_millis(200))
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(result.stderr.contains("Execution timed out after 0.2 seconds"), "{}", result.stderr);
    }

    #[test]
    fn missing_interpreter_is_backend_unavailable() {
        let missing = LocalInterpreter::new(
            Language::Javascript,
            "/nonexistent/fixloop-node",
            SourceMode::Argument("-e"),
            test_env(),
            1000,
        );
        let result = missing
            .run(&CodeFragment::new(Language::Javascript, "1"), Duration::from_secs(1))
            .expect("run");
        assert_eq!(result.failure, Some(FailureKind::BackendUnavailable));
        assert!(result.stderr.contains("fixloop-node"));
    }

    #[test]
    fn disconnected_device_is_backend_unavailable() {
        let bridge = Arc::new(FakeDeviceBridge::disconnected());
        let strategy = DeviceStrategy::new(Language::Android, bridge.clone(), false, "/data/local/tmp");
        let result = strategy
            .run(&CodeFragment::new(Language::Android, "getprop"), Duration::from_secs(1))
            .expect("run");
        assert_eq!(result.failure, Some(FailureKind::BackendUnavailable));
        assert!(bridge.shell_calls().is_empty());
    }

    #[test]
    fn device_script_is_pushed_run_elevated_and_removed() {
        let bridge = Arc::new(FakeDeviceBridge::connected(0, "uid=0(root)\n"));
        let strategy = DeviceStrategy::new(Language::AndroidRoot, bridge.clone(), true, "/data/local/tmp/");
        let result = strategy
            .run(&CodeFragment::new(Language::AndroidRoot, "id"), Duration::from_secs(5))
            .expect("run");
        assert!(result.success);
        assert_eq!(result.stdout, "uid=0(root)\n");

        let pushes = bridge.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, "id");
        let remote = &pushes[0].0;
        assert!(remote.starts_with("/data/local/tmp/fixloop_"), "{remote}");

        let calls = bridge.shell_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (format!("sh {remote}"), true));
        assert_eq!(calls[1], (format!("rm -f {remote}"), true));
    }
}
