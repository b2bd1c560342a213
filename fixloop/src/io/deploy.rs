//! Detached server deployments.
//!
//! [`DeploymentManager`] materializes files into a fresh directory, starts a
//! static or dynamic server in its own process group, and tracks it in a
//! [`ProcessRegistry`]. A tracked deployment is never signalled without an
//! ownership verdict from [`verify_ownership`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::ownership::{Ownership, ProtectionRules, verify_ownership};
use crate::core::types::{Deployment, DeploymentId, NO_EXIT_CODE, SERVER_LOG, ServerKind};
use crate::io::config::DeployConfig;
use crate::io::database::provision_starter_db;
use crate::io::ports::{BindProbe, PortAllocator, PortGrant};
use crate::io::proc_table::{HostProcessTable, ProcessTable, TermSignal};
use crate::io::process::{DetachedChild, spawn_detached};
use crate::io::registry::ProcessRegistry;

pub const INDEX_FILE: &str = "index.html";
pub const BACKEND_FILE: &str = "app.py";
const BACKEND_TEMPLATE: &str = include_str!("templates/backend.py");
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Files to serve and how to serve them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeployContent {
    /// Relative paths inside the deployment directory.
    pub files: BTreeMap<PathBuf, String>,
    pub backend: bool,
    pub database: bool,
}

impl DeployContent {
    /// A single HTML document served as `index.html`.
    pub fn document(html: impl Into<String>) -> Self {
        Self {
            files: BTreeMap::from([(PathBuf::from(INDEX_FILE), html.into())]),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: bool) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_database(mut self, database: bool) -> Self {
        self.database = database;
        self
    }

    pub fn server_kind(&self) -> ServerKind {
        if self.backend {
            ServerKind::DynamicBackend
        } else {
            ServerKind::Static
        }
    }
}

/// Post-launch HTTP check.
pub trait LivenessProbe: Send + Sync {
    fn responds(&self, port: u16) -> bool;
}

/// Probe issuing `GET /` against the loopback interface.
pub struct HttpProbe {
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http probe client")?;
        Ok(Self { client })
    }
}

impl LivenessProbe for HttpProbe {
    fn responds(&self, port: u16) -> bool {
        self.client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .is_ok()
    }
}

impl<F: Fn(u16) -> bool + Send + Sync> LivenessProbe for F {
    fn responds(&self, port: u16) -> bool {
        self(port)
    }
}

/// Result of [`DeploymentManager::deploy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The server survived the liveness window and is tracked.
    Serving {
        deployment: Deployment,
        /// Whether any HTTP probe got an answer.
        responding: bool,
    },
    /// The server exited during the liveness window. Nothing is tracked.
    Exited {
        port: u16,
        exit_code: i32,
        /// Contents of the server log.
        log: String,
    },
}

/// Result of [`DeploymentManager::stop`]. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        /// The group ignored the terminate signal and was killed.
        forced: bool,
    },
    /// The process was already gone; the record and directory were cleaned up.
    AlreadyExited,
    /// Ownership could not be established or the process is protected. Nothing was signalled.
    OwnershipDenied { reason: String },
    NotFound,
}

impl StopOutcome {
    /// Whether the deployment is no longer tracked because of this call.
    pub fn removed(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::AlreadyExited)
    }
}

pub struct DeploymentManager {
    config: DeployConfig,
    env: BTreeMap<String, String>,
    rules: ProtectionRules,
    ports: PortAllocator,
    registry: Arc<ProcessRegistry>,
    table: Arc<dyn ProcessTable>,
    probe: Box<dyn LivenessProbe>,
}

impl DeploymentManager {
    pub fn new(
        config: DeployConfig,
        env: BTreeMap<String, String>,
        ports: PortAllocator,
        registry: Arc<ProcessRegistry>,
        table: Arc<dyn ProcessTable>,
        probe: Box<dyn LivenessProbe>,
    ) -> Self {
        let rules = config.protection_rules();
        Self {
            config,
            env,
            rules,
            ports,
            registry,
            table,
            probe,
        }
    }

    /// Manager wired to the real host: bind probing, `/proc`, HTTP liveness.
    pub fn for_host(config: &DeployConfig, env: BTreeMap<String, String>) -> Result<Self> {
        let ports = PortAllocator::from_config(config, Box::new(BindProbe))?;
        let probe = HttpProbe::new(Duration::from_secs(1))?;
        Ok(Self::new(
            config.clone(),
            env,
            ports,
            Arc::new(ProcessRegistry::new()),
            Arc::new(HostProcessTable),
            Box::new(probe),
        ))
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Materialize `content` and launch its server detached.
    ///
    /// Errors only when the deployment could not be attempted (directory,
    /// files, database, port, spawn). A server that dies on startup is an
    /// [`LaunchOutcome::Exited`].
    #[instrument(skip_all, fields(kind = content.server_kind().as_str(), files = content.files.len()))]
    pub fn deploy(&self, content: &DeployContent) -> Result<LaunchOutcome> {
        let id = self.registry.next_id();
        let base_dir = self.config.base_dir();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("create deploy base {}", base_dir.display()))?;
        let directory = base_dir.join(format!("web_{id}"));
        fs::create_dir(&directory)
            .with_context(|| format!("create deployment directory {}", directory.display()))?;

        match self.launch(id, &directory, content) {
            Ok(outcome) => {
                if matches!(outcome, LaunchOutcome::Exited { .. }) {
                    self.remove_directory(&directory);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.remove_directory(&directory);
                Err(err)
            }
        }
    }

    fn launch(
        &self,
        id: DeploymentId,
        directory: &Path,
        content: &DeployContent,
    ) -> Result<LaunchOutcome> {
        write_content(directory, content)?;
        if content.database {
            provision_starter_db(directory)?;
        }

        let grant = self.ports.allocate()?;
        if let PortGrant::Fallback(port) = grant {
            warn!(port, "deploying on fallback port");
        }
        let port = grant.port();

        let template = match content.server_kind() {
            ServerKind::Static => &self.config.static_command,
            ServerKind::DynamicBackend => &self.config.backend_command,
        };
        let argv = render_command(template, port, directory);
        let log_path = directory.join(SERVER_LOG);
        let mut detached = match spawn_detached(&argv, directory, &self.env, &log_path) {
            Ok(d) => d,
            Err(err) => {
                self.ports.release(port);
                return Err(err);
            }
        };

        let (exited, responding) = match self.await_startup(&mut detached, port) {
            Ok(startup) => startup,
            Err(err) => {
                self.abandon_launch(&mut detached, port);
                return Err(err);
            }
        };
        if let Some(status) = exited {
            self.ports.release(port);
            let log = fs::read_to_string(&log_path).unwrap_or_default();
            warn!(pid = detached.pid, exit_code = ?status.code(), "server exited during startup");
            return Ok(LaunchOutcome::Exited {
                port,
                exit_code: status.code().unwrap_or(NO_EXIT_CODE),
                log,
            });
        }

        let deployment = Deployment {
            id,
            directory: directory.to_path_buf(),
            port,
            process_id: detached.pid,
            process_group_id: detached.pgid,
            server_kind: content.server_kind(),
            started_at: Utc::now(),
        };
        self.registry.insert(deployment.clone());
        info!(
            id = %id,
            port,
            pid = detached.pid,
            responding,
            "deployment serving"
        );
        Ok(LaunchOutcome::Serving {
            deployment,
            responding,
        })
    }

    /// Wait out the startup delay and probe. Returns the exit status if the server
    /// died, and whether any probe got an answer.
    fn await_startup(&self, detached: &mut DetachedChild, port: u16) -> Result<(Option<ExitStatus>, bool)> {
        thread::sleep(self.config.startup_delay());
        let mut responding = false;
        for attempt in 0..self.config.probe_attempts {
            if detached.child.try_wait().context("poll server")?.is_some() {
                break;
            }
            if self.probe.responds(port) {
                responding = true;
                break;
            }
            debug!(attempt, port, "server not answering yet");
            thread::sleep(self.config.probe_interval());
        }
        let exited = detached.child.try_wait().context("poll server")?;
        Ok((exited, responding))
    }

    /// Kill a server that was spawned but cannot be tracked, and free its port.
    fn abandon_launch(&self, detached: &mut DetachedChild, port: u16) {
        warn!(pid = detached.pid, port, "abandoning untracked server");
        if let Err(err) = self.table.signal_group(detached.pgid, TermSignal::Kill) {
            warn!(err = %format!("{err:#}"), pgid = detached.pgid, "failed to kill server group");
        }
        if let Err(err) = detached.child.kill() {
            debug!(err = %err, "server already gone");
        }
        let _ = detached.child.wait();
        self.ports.release(port);
    }

    /// Terminate a tracked deployment after verifying ownership.
    #[instrument(skip(self))]
    pub fn stop(&self, id: DeploymentId) -> StopOutcome {
        let Some(deployment) = self.registry.get(id) else {
            debug!("no such deployment");
            return StopOutcome::NotFound;
        };

        let snapshot = match self.table.snapshot(deployment.process_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(pid = deployment.process_id, "process already exited");
                self.forget(id);
                return StopOutcome::AlreadyExited;
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "cannot inspect process");
                return StopOutcome::OwnershipDenied {
                    reason: format!("cannot inspect process {}: {err:#}", deployment.process_id),
                };
            }
        };

        match verify_ownership(&snapshot, &deployment, &self.rules) {
            Ownership::Owned(basis) => {
                debug!(?basis, pid = deployment.process_id, "ownership verified");
            }
            Ownership::NotOwned => {
                warn!(pid = deployment.process_id, cmdline = %snapshot.cmdline, "refusing to stop unowned process");
                return StopOutcome::OwnershipDenied {
                    reason: format!(
                        "process {} is not owned by deployment {id}",
                        deployment.process_id
                    ),
                };
            }
            Ownership::Protected { reason } => {
                warn!(pid = deployment.process_id, %reason, "refusing to stop protected process");
                return StopOutcome::OwnershipDenied { reason };
            }
        }

        let forced = match self.terminate_group(deployment.process_group_id) {
            Ok(forced) => forced,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to signal process group");
                return StopOutcome::OwnershipDenied {
                    reason: format!("{err:#}"),
                };
            }
        };
        self.forget(id);
        StopOutcome::Stopped { forced }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL. Returns whether the kill was needed.
    fn terminate_group(&self, pgid: u32) -> Result<bool> {
        if !self.table.signal_group(pgid, TermSignal::Terminate)? {
            return Ok(false);
        }
        let deadline = Instant::now() + self.config.grace_period();
        while Instant::now() < deadline {
            if !self.table.group_alive(pgid) {
                return Ok(false);
            }
            thread::sleep(GROUP_POLL_INTERVAL);
        }
        if !self.table.group_alive(pgid) {
            return Ok(false);
        }
        warn!(pgid, "group survived grace period, killing");
        self.table.signal_group(pgid, TermSignal::Kill)?;
        Ok(true)
    }

    /// Tracked deployments after dropping those whose process has exited.
    pub fn list(&self) -> Vec<Deployment> {
        for deployment in self.registry.snapshot() {
            if !self.table.is_alive(deployment.process_id) {
                info!(id = %deployment.id, pid = deployment.process_id, "reconciling exited deployment");
                self.forget(deployment.id);
            }
        }
        self.registry.snapshot()
    }

    /// Stop every tracked deployment.
    pub fn stop_all(&self) -> Vec<(DeploymentId, StopOutcome)> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|d| (d.id, self.stop(d.id)))
            .collect()
    }

    fn forget(&self, id: DeploymentId) {
        if let Some(deployment) = self.registry.remove(id) {
            self.ports.release(deployment.port);
            self.remove_directory(&deployment.directory);
        }
    }

    fn remove_directory(&self, directory: &Path) {
        let base = self.config.base_dir();
        if !directory.starts_with(&base) || directory == base {
            warn!(dir = %directory.display(), "refusing to remove directory outside deploy base");
            return;
        }
        match fs::remove_dir_all(directory) {
            Ok(()) => debug!(dir = %directory.display(), "removed deployment directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %directory.display(), err = %e, "failed to remove deployment directory"),
        }
    }
}

fn write_content(directory: &Path, content: &DeployContent) -> Result<()> {
    for (relative, body) in &content.files {
        let path = resolve_inside(directory, relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    }
    if content.backend && !content.files.contains_key(Path::new(BACKEND_FILE)) {
        let path = directory.join(BACKEND_FILE);
        fs::write(&path, BACKEND_TEMPLATE).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// `directory/relative`, rejecting absolute paths and `..`.
fn resolve_inside(directory: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.as_os_str().is_empty() {
        bail!("empty file path in deployment content");
    }
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!(
            "file path {} escapes the deployment directory",
            relative.display()
        ));
    }
    Ok(directory.join(relative))
}

/// Substitute `{port}` and `{dir}` in every argument.
fn render_command(template: &[String], port: u16, dir: &Path) -> Vec<String> {
    let port = port.to_string();
    let dir = dir.to_string_lossy();
    template
        .iter()
        .map(|arg| arg.replace("{port}", &port).replace("{dir}", &dir))
        .collect()
}
