//! Engine configuration stored in `fixloop.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::ownership::ProtectionRules;

pub const DEFAULT_CONFIG_FILE: &str = "fixloop.toml";

/// Engine configuration (TOML).
///
/// Missing fields default to values tuned for a single-user workstation.
/// Timeout growth and the reserved port list are environment specific and are
/// expected to be overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub deploy: DeployConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout for a direct `exec` without retries.
    pub default_timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    pub python: String,
    pub node: String,
    pub shell: String,
    /// Variables copied from the caller's environment when set.
    pub env_passthrough: Vec<String>,
    /// Variables set when the caller does not provide them.
    pub env_defaults: BTreeMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            output_limit_bytes: 1_000_000,
            python: "python3".to_string(),
            node: "node".to_string(),
            shell: "/bin/sh".to_string(),
            env_passthrough: ["PATH", "HOME", "USER", "LANG", "LC_ALL", "PYTHONPATH", "TERM"]
                .into_iter()
                .map(String::from)
                .collect(),
            env_defaults: BTreeMap::from([
                (
                    "PATH".to_string(),
                    "/usr/local/bin:/usr/bin:/bin".to_string(),
                ),
                ("LANG".to_string(), "C.UTF-8".to_string()),
                ("LC_ALL".to_string(), "C.UTF-8".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ]),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// What happens to a session's error-history file when the session ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryRetention {
    /// Delete on success, keep on failure for post-mortem.
    #[default]
    DeleteOnSuccess,
    Keep,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_timeout_secs: u64,
    pub step_secs: u64,
    pub cap_secs: u64,
    /// Directory for error-history files. Defaults to the system temp dir.
    pub history_dir: Option<PathBuf>,
    pub retention: HistoryRetention,
    /// Command that reads a fix prompt on stdin and prints the reply (e.g. `["claude","-p"]`).
    pub fix_command: Vec<String>,
    pub fix_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout_secs: 120,
            step_secs: 90,
            cap_secs: 300,
            history_dir: None,
            retention: HistoryRetention::default(),
            fix_command: vec!["claude".to_string(), "-p".to_string()],
            fix_timeout_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fixloop"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    /// Parent directory for deployment directories. Defaults to the system temp dir.
    pub base_dir: Option<PathBuf>,
    pub base_port: u16,
    pub port_scan_limit: u16,
    /// Last-resort port returned when the scan finds nothing free.
    pub fallback_port: u16,
    pub reserved_ports: BTreeSet<u16>,
    /// Command line fragments of host services that must never be signalled.
    pub protected_keywords: Vec<String>,
    /// Static server argv. `{port}` and `{dir}` are substituted.
    pub static_command: Vec<String>,
    /// Dynamic backend argv. `{port}` and `{dir}` are substituted.
    pub backend_command: Vec<String>,
    pub probe_attempts: u32,
    pub probe_interval_ms: u64,
    /// Pause between spawn and the first liveness probe.
    pub startup_delay_ms: u64,
    /// Wait between the terminate and kill signals.
    pub grace_period_ms: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            base_port: 8080,
            port_scan_limit: 100,
            fallback_port: 9500,
            reserved_ports: BTreeSet::from([4712, 4713, 6600, 8000, 8001]),
            protected_keywords: [
                "pulseaudio",
                "pulse",
                "paplay",
                "pactl",
                "pacmd",
                "kex-audio",
                "termux-audio",
                "audio-warmstart",
                "mpd",
                "alsa",
                "jackd",
                "pipewire",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            static_command: ["python3", "-m", "http.server", "{port}", "--bind", "127.0.0.1"]
                .into_iter()
                .map(String::from)
                .collect(),
            backend_command: ["python3", "app.py", "{port}"]
                .into_iter()
                .map(String::from)
                .collect(),
            probe_attempts: 5,
            probe_interval_ms: 500,
            startup_delay_ms: 300,
            grace_period_ms: 2000,
        }
    }
}

impl DeployConfig {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fixloop"))
    }

    pub fn protection_rules(&self) -> ProtectionRules {
        ProtectionRules {
            keywords: self.protected_keywords.clone(),
            reserved_ports: self.reserved_ports.clone(),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_path: String,
    /// Writable directory on the device for pushed scripts.
    pub remote_dir: String,
    pub check_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            remote_dir: "/data/local/tmp".to_string(),
            check_timeout_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        if self.execution.default_timeout_secs == 0 {
            return Err(anyhow!("execution.default_timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        if self.retry.cap_secs == 0 {
            return Err(anyhow!("retry.cap_secs must be > 0"));
        }
        if self.retry.fix_timeout_secs == 0 {
            return Err(anyhow!("retry.fix_timeout_secs must be > 0"));
        }
        let deploy = &self.deploy;
        if deploy.reserved_ports.contains(&deploy.fallback_port) {
            return Err(anyhow!(
                "deploy.fallback_port {} is in deploy.reserved_ports",
                deploy.fallback_port
            ));
        }
        if deploy.fallback_port == 0 || deploy.base_port == 0 {
            return Err(anyhow!("deploy ports must be > 0"));
        }
        for (name, argv) in [
            ("deploy.static_command", &deploy.static_command),
            ("deploy.backend_command", &deploy.backend_command),
        ] {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        if deploy.probe_attempts == 0 {
            return Err(anyhow!("deploy.probe_attempts must be >= 1"));
        }
        if self.device.adb_path.trim().is_empty() {
            return Err(anyhow!("device.adb_path must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn serialized_config_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        let mut cfg = EngineConfig::default();
        cfg.retry.retention = HistoryRetention::Keep;
        cfg.deploy.reserved_ports.insert(9000);
        fs::write(&path, toml::to_string_pretty(&cfg).expect("serialize")).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        fs::write(&path, "[retry]\nstep_secs = 30\nretention = \"keep\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.retry.step_secs, 30);
        assert_eq!(cfg.retry.cap_secs, 300);
        assert_eq!(cfg.retry.retention, HistoryRetention::Keep);
        assert_eq!(cfg.deploy, DeployConfig::default());
    }

    #[test]
    fn reserved_fallback_port_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.deploy.fallback_port = 4713;
        let err = cfg.validate().expect_err("reserved fallback");
        assert!(err.to_string().contains("fallback_port"), "{err}");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
