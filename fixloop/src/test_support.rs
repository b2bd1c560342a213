//! Test-only fakes for executors, model clients, device bridges, and the process table.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::language::Language;
use crate::core::ownership::ProcessSnapshot;
use crate::core::types::{CodeFragment, ExecutionResult, FailureKind};
use crate::dispatch::Execute;
use crate::io::completion::CompletionClient;
use crate::io::device::{BridgeOutput, DeviceBridge};
use crate::io::proc_table::{ProcessTable, TermSignal};

/// Environment for real child processes in tests.
pub fn test_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin".to_string(),
        ),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ])
}

pub fn success(language: Language, stdout: &str) -> ExecutionResult {
    ExecutionResult::succeeded(
        language,
        stdout.to_string(),
        String::new(),
        Duration::from_millis(5),
    )
}

/// A non-zero exit (code 1) with `stderr`.
pub fn failure(language: Language, stderr: &str) -> ExecutionResult {
    ExecutionResult::failed(
        language,
        FailureKind::ExecutionFailure,
        1,
        String::new(),
        stderr.to_string(),
        Duration::from_millis(5),
    )
}

/// Executor that replays scripted results and records what it was asked to run.
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<ExecutionResult>>>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<Result<ExecutionResult>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(source, timeout)` per call, in order.
    pub fn calls(&self) -> Vec<(String, Duration)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Execute for ScriptedExecutor {
    fn execute(&self, fragment: &CodeFragment, timeout: Duration) -> Result<ExecutionResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((fragment.source.clone(), timeout));
        self.results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted executor exhausted")))
    }
}

/// Model client that replays scripted replies and records prompts.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl CompletionClient for ScriptedClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted client exhausted")))
    }
}

/// Device bridge that answers `sh <script>` with a fixed output.
pub struct FakeDeviceBridge {
    connected: bool,
    exit_code: i32,
    stdout: String,
    pushes: Mutex<Vec<(String, String)>>,
    shell_calls: Mutex<Vec<(String, bool)>>,
}

impl FakeDeviceBridge {
    pub fn connected(exit_code: i32, stdout: &str) -> Self {
        Self {
            connected: true,
            exit_code,
            stdout: stdout.to_string(),
            pushes: Mutex::new(Vec::new()),
            shell_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::connected(0, "")
        }
    }

    /// `(remote path, pushed file contents)` per push.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().expect("pushes lock").clone()
    }

    /// `(command, elevated)` per shell call.
    pub fn shell_calls(&self) -> Vec<(String, bool)> {
        self.shell_calls.lock().expect("shell lock").clone()
    }
}

impl DeviceBridge for FakeDeviceBridge {
    fn is_connected(&self) -> Result<bool> {
        Ok(self.connected)
    }

    fn shell(&self, command: &str, elevated: bool, _timeout: Duration) -> Result<BridgeOutput> {
        self.shell_calls
            .lock()
            .expect("shell lock")
            .push((command.to_string(), elevated));
        let (exit_code, stdout) = if command.starts_with("sh ") {
            (self.exit_code, self.stdout.clone())
        } else {
            (0, String::new())
        };
        Ok(BridgeOutput {
            exit_code,
            stdout,
            stderr: String::new(),
            timed_out: false,
        })
    }

    fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let contents = fs::read_to_string(local)?;
        self.pushes
            .lock()
            .expect("pushes lock")
            .push((remote.to_string(), contents));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeProcess {
    snapshot: ProcessSnapshot,
    alive: bool,
    /// Survives SIGTERM; only SIGKILL ends it.
    ignores_terminate: bool,
}

/// In-memory process table. Signals flip liveness instead of touching the host.
#[derive(Default)]
pub struct FakeProcessTable {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    signals: Mutex<Vec<(u32, TermSignal)>>,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: ProcessSnapshot) {
        self.insert_with(snapshot, false);
    }

    pub fn insert_stubborn(&self, snapshot: ProcessSnapshot) {
        self.insert_with(snapshot, true);
    }

    fn insert_with(&self, snapshot: ProcessSnapshot, ignores_terminate: bool) {
        self.processes.lock().expect("processes lock").insert(
            snapshot.pid,
            FakeProcess {
                snapshot,
                alive: true,
                ignores_terminate,
            },
        );
    }

    pub fn exit(&self, pid: u32) {
        if let Some(process) = self.processes.lock().expect("processes lock").get_mut(&pid) {
            process.alive = false;
        }
    }

    /// `(pgid, signal)` per signal sent.
    pub fn signals(&self) -> Vec<(u32, TermSignal)> {
        self.signals.lock().expect("signals lock").clone()
    }
}

impl ProcessTable for FakeProcessTable {
    fn snapshot(&self, pid: u32) -> Result<Option<ProcessSnapshot>> {
        let processes = self.processes.lock().expect("processes lock");
        Ok(processes
            .get(&pid)
            .filter(|p| p.alive)
            .map(|p| p.snapshot.clone()))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let processes = self.processes.lock().expect("processes lock");
        processes.get(&pid).is_some_and(|p| p.alive)
    }

    fn signal_group(&self, pgid: u32, signal: TermSignal) -> Result<bool> {
        self.signals
            .lock()
            .expect("signals lock")
            .push((pgid, signal));
        let mut processes = self.processes.lock().expect("processes lock");
        let mut any = false;
        for process in processes.values_mut() {
            if process.alive && process.snapshot.pgid == Some(pgid) {
                any = true;
                if signal == TermSignal::Kill || !process.ignores_terminate {
                    process.alive = false;
                }
            }
        }
        Ok(any)
    }

    fn group_alive(&self, pgid: u32) -> bool {
        let processes = self.processes.lock().expect("processes lock");
        processes
            .values()
            .any(|p| p.alive && p.snapshot.pgid == Some(pgid))
    }
}
