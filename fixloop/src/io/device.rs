//! Device bridge backend for android fragments.
//!
//! The [`DeviceBridge`] trait decouples dispatch from the actual bridge
//! (currently `adb`). Tests use a scripted bridge that never spawns processes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::config::DeviceConfig;
use crate::io::process::{isolated_command, run_command_with_timeout};

/// Result of a remote shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait DeviceBridge: Send + Sync {
    /// Whether at least one device is attached and authorized.
    fn is_connected(&self) -> Result<bool>;
    /// Run `command` in the device shell, wrapped in `su -c` when `elevated`.
    fn shell(&self, command: &str, elevated: bool, timeout: Duration) -> Result<BridgeOutput>;
    fn push(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Bridge that shells out to `adb`.
pub struct AdbBridge {
    adb_path: String,
    check_timeout: Duration,
    env: BTreeMap<String, String>,
    output_limit_bytes: usize,
}

impl AdbBridge {
    pub fn new(config: &DeviceConfig, env: BTreeMap<String, String>, output_limit_bytes: usize) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
            check_timeout: Duration::from_secs(config.check_timeout_secs),
            env,
            output_limit_bytes,
        }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<BridgeOutput> {
        let mut cmd = isolated_command(&self.adb_path, &self.env);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run {} {}", self.adb_path, args.first().unwrap_or(&"")))?;
        Ok(BridgeOutput {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}

impl DeviceBridge for AdbBridge {
    #[instrument(skip_all)]
    fn is_connected(&self) -> Result<bool> {
        let output = self.run(&["devices"], self.check_timeout)?;
        if output.timed_out || output.exit_code != 0 {
            warn!(exit_code = output.exit_code, timed_out = output.timed_out, "adb devices failed");
            return Ok(false);
        }
        let devices = connected_devices(&output.stdout);
        debug!(count = devices.len(), "adb devices");
        Ok(!devices.is_empty())
    }

    #[instrument(skip_all, fields(elevated, timeout_secs = timeout.as_secs()))]
    fn shell(&self, command: &str, elevated: bool, timeout: Duration) -> Result<BridgeOutput> {
        let wrapped = if elevated {
            wrap_elevated(command)
        } else {
            command.to_string()
        };
        self.run(&["shell", &wrapped], timeout)
    }

    #[instrument(skip_all, fields(remote))]
    fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let local = local
            .to_str()
            .ok_or_else(|| anyhow!("local path is not valid UTF-8: {}", local.display()))?;
        let output = self.run(&["push", local, remote], self.check_timeout.max(Duration::from_secs(30)))?;
        if output.timed_out || output.exit_code != 0 {
            return Err(anyhow!(
                "adb push failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

/// Serials from `adb devices` output whose state is exactly `device`.
pub fn connected_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            (parts.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

/// `su -c '<command>'` with single quotes escaped for a POSIX shell.
pub fn wrap_elevated(command: &str) -> String {
    format!("su -c '{}'", command.replace('\'', r"'\''"))
}
