//! End-to-end retry sessions against real local interpreters.
//!
//! Fix replies come from closures so no model is needed. Tests that need
//! `python3` skip themselves when it is not installed.

use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fixloop::core::language::Language;
use fixloop::core::types::{CodeFragment, FailureKind};
use fixloop::dispatch::{Execute, LanguageDispatcher};
use fixloop::io::config::{EngineConfig, HistoryRetention};
use fixloop::io::deploy::DeploymentManager;
use fixloop::retry::{RetryOrchestrator, RetryRequest, RetrySettings, RetryStop};
use fixloop::test_support::{FakeDeviceBridge, test_env};

fn have(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn dispatcher(base: &std::path::Path) -> LanguageDispatcher {
    let mut config = EngineConfig::default();
    config.deploy.base_dir = Some(base.join("deploy"));
    let deployments =
        DeploymentManager::for_host(&config.deploy, test_env()).expect("deployment manager");
    LanguageDispatcher::from_config(
        &config,
        test_env(),
        Arc::new(deployments),
        Arc::new(FakeDeviceBridge::disconnected()),
    )
}

fn settings(base: &std::path::Path, retention: HistoryRetention) -> RetrySettings {
    RetrySettings {
        step: Duration::from_secs(5),
        cap: Duration::from_secs(20),
        history_dir: base.join("history"),
        retention,
    }
}

#[test]
fn python_error_is_fixed_on_second_attempt() {
    if !have("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let dispatcher = dispatcher(temp.path());
    let orchestrator = RetryOrchestrator::new(&dispatcher, settings(temp.path(), HistoryRetention::Keep));

    let prompts = Mutex::new(Vec::new());
    let fix = |prompt: &str| -> anyhow::Result<String> {
        prompts.lock().expect("prompts").push(prompt.to_string());
        Ok("Here you go:\n```python\nprint(1)\n```\n".to_string())
    };
    let request = RetryRequest {
        goal: "print a number".to_string(),
        fragment: CodeFragment::new(Language::Python, "print(1/0)\n"),
        max_attempts: 2,
        base_timeout: Duration::from_secs(10),
    };
    let session = orchestrator.run(&request, &fix).expect("session");

    assert_eq!(session.stop, RetryStop::Succeeded { recovered: true });
    assert_eq!(session.attempts.len(), 2);
    let first = &session.attempts[0].result;
    assert!(!first.success);
    assert_eq!(first.failure, Some(FailureKind::ExecutionFailure));
    assert!(first.stderr.contains("ZeroDivisionError"), "stderr: {}", first.stderr);
    assert_eq!(session.final_result.stdout, "1\n");
    assert_eq!(session.attempts[0].timeout_used, Duration::from_secs(10));
    assert_eq!(session.attempts[1].timeout_used, Duration::from_secs(15));

    let prompts = prompts.lock().expect("prompts");
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("print a number"));
    assert!(prompts[0].contains("ZeroDivisionError"));

    let history = session.history_path.expect("history kept");
    let text = std::fs::read_to_string(history).expect("read history");
    assert!(text.contains("print(1/0)"));
}

#[test]
fn single_attempt_returns_failure_without_asking_for_a_fix() {
    if !have("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let dispatcher = dispatcher(temp.path());
    let orchestrator =
        RetryOrchestrator::new(&dispatcher, settings(temp.path(), HistoryRetention::DeleteOnSuccess));

    let fix = |_: &str| -> anyhow::Result<String> { panic!("fix must not be requested") };
    let fragment = CodeFragment::new(Language::Python, "import sys\nsys.stderr.write('boom')\nsys.exit(3)\n");
    let direct = dispatcher
        .execute(&fragment, Duration::from_secs(10))
        .expect("direct run");
    let result = orchestrator
        .run_with_retry(fragment, 1, Duration::from_secs(10), &fix)
        .expect("session");

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "boom");
    assert_eq!(result.stdout, direct.stdout);
    assert_eq!(result.stderr, direct.stderr);
    assert_eq!(result.exit_code, direct.exit_code);
}

#[test]
fn unknown_language_is_reported_without_spawning() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dispatcher = dispatcher(temp.path());
    let fragment = CodeFragment::new(Language::from_tag("ruby"), "puts 1");

    let result = dispatcher
        .execute(&fragment, Duration::from_secs(5))
        .expect("dispatch");

    assert!(!result.success);
    assert_eq!(result.exit_code, -1);
    assert_eq!(result.failure, Some(FailureKind::UnsupportedLanguage));
    assert!(result.stderr.contains("ruby"), "stderr: {}", result.stderr);
    assert_eq!(result.duration, Duration::ZERO);
}

#[test]
fn shell_timeout_escalates_the_next_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dispatcher = dispatcher(temp.path());
    let orchestrator = RetryOrchestrator::new(
        &dispatcher,
        RetrySettings {
            step: Duration::from_secs(1),
            cap: Duration::from_secs(3),
            history_dir: temp.path().join("history"),
            retention: HistoryRetention::Delete,
        },
    );

    let fix = |_: &str| -> anyhow::Result<String> { Ok("```sh\necho done\n```".to_string()) };
    let request = RetryRequest {
        goal: "finish quickly".to_string(),
        fragment: CodeFragment::new(Language::Shell, "sleep 30\n"),
        max_attempts: 2,
        base_timeout: Duration::from_secs(1),
    };
    let session = orchestrator.run(&request, &fix).expect("session");

    let first = &session.attempts[0].result;
    assert!(first.timed_out);
    assert_eq!(first.failure, Some(FailureKind::Timeout));
    assert_eq!(session.attempts[1].timeout_used, Duration::from_secs(2));
    assert_eq!(session.final_result.stdout, "done\n");
    assert!(session.history_path.is_none());
}
