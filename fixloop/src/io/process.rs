//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every child gets an explicitly constructed environment and its own process
//! group, so a timeout kills the whole tree rather than only the direct child.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::NO_EXIT_CODE;

/// How long readers get to reach EOF once the deadline has passed and the group is dead.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(NO_EXIT_CODE)
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// The program could not be started at all (missing binary, permissions).
#[derive(Debug)]
pub struct SpawnError {
    pub program: String,
    pub source: io::Error,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to start {}: {}", self.program, self.source)
    }
}

impl Error for SpawnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Build the environment handed to children: selected caller variables plus defaults.
pub fn minimal_env(
    passthrough: &[String],
    defaults: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for name in passthrough {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }
    for (name, value) in defaults {
        env.entry(name.clone()).or_insert_with(|| value.clone());
    }
    env
}

/// A `Command` that sees only `env`.
pub fn isolated_command(program: impl AsRef<std::ffi::OsStr>, env: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear().envs(env);
    cmd
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout the child's whole process group is killed. Group members still running after a
/// normal exit are killed too. The timeout also bounds the pipe reads: if something outside
/// the group keeps the pipes open past the deadline, the readers are abandoned and the
/// output is reported as timed out with whatever was captured.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    detach(&mut cmd);

    debug!(program = %cmd.get_program().to_string_lossy(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(SpawnError {
                program: cmd.get_program().to_string_lossy().into_owned(),
                source: e,
            }
            .into());
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || match pipe.write_all(&input) {
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let pgid = child.id();
    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => {
            if kill_group(pgid).unwrap_or(false) {
                debug!(pgid, "killed processes left running by command");
            }
            status
        }
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Processes that left the group can hold the pipes open indefinitely.
    let drain_deadline = (started + timeout).max(Instant::now() + DRAIN_GRACE);
    let mut pending = 2;
    while pending > 0 {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(result) => {
                result?;
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(pgid, "output pipes still open after deadline, abandoning readers");
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }

    if let Some(handle) = stdin_handle {
        if handle.is_finished() {
            match handle.join() {
                Ok(result) => result.context("write stdin")?,
                Err(_) => return Err(anyhow!("stdin writer thread panicked")),
            }
        } else {
            warn!("stdin still blocked after command finished, abandoning writer");
        }
    }
    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);
    let elapsed = started.elapsed();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// A server process running in its own process group with output sent to a log file.
#[derive(Debug)]
pub struct DetachedChild {
    pub child: Child,
    pub pid: u32,
    pub pgid: u32,
}

/// Spawn `argv` detached from the caller: new process group, stdin closed,
/// stdout and stderr appended to `log_path`. The child outlives the caller.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), dir = %dir.display()))]
pub fn spawn_detached(
    argv: &[String],
    dir: &Path,
    env: &BTreeMap<String, String>,
    log_path: &Path,
) -> Result<DetachedChild> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("server command must not be empty"))?;
    let log = File::create(log_path)
        .with_context(|| format!("create server log {}", log_path.display()))?;
    let log_err = log.try_clone().context("clone server log handle")?;

    let mut cmd = isolated_command(program, env);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    detach(&mut cmd);

    let child = cmd.spawn().map_err(|e| SpawnError {
        program: program.clone(),
        source: e,
    })?;
    let pid = child.id();
    debug!(pid, "spawned detached process");
    Ok(DetachedChild {
        child,
        pid,
        pgid: pid,
    })
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// SIGKILL every member of group `pgid`. `Ok(false)` when the group is already empty.
#[cfg(unix)]
fn kill_group(pgid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pgid).context("pgid out of range")?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(anyhow!("killpg {pgid}: {e}")),
    }
}

#[cfg(windows)]
fn kill_group(_pgid: u32) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    if let Err(err) = kill_group(child.id()) {
        warn!(err = %format!("{err:#}"), "group kill failed, killing child only");
        return child.kill().context("kill child");
    }
    Ok(())
}

#[cfg(windows)]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

/// Output read so far from one stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Drain `stream` on its own thread. The thread reports on `done` when it sees EOF.
fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> Arc<Mutex<Captured>> {
    let capture = Arc::new(Mutex::new(Captured::default()));
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let _ = done.send(read_stream_limited(stream, limit, &sink));
    });
    capture
}

fn take_capture(capture: &Mutex<Captured>) -> (Vec<u8>, usize) {
    let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
    let captured = std::mem::take(&mut *captured);
    (captured.bytes, captured.truncated)
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}
