//! Host process inspection and group signalling.
//!
//! [`ProcessTable`] is the only path through which the deployment manager
//! observes or signals processes, which keeps termination logic testable with
//! a fake table.

use anyhow::Result;

use crate::core::ownership::ProcessSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// Polite shutdown request (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
}

pub trait ProcessTable: Send + Sync {
    /// Snapshot of a live process. `None` once the process has exited.
    fn snapshot(&self, pid: u32) -> Result<Option<ProcessSnapshot>>;
    fn is_alive(&self, pid: u32) -> bool;
    /// Signal every process in the group. `Ok(false)` when the group no longer exists.
    fn signal_group(&self, pgid: u32, signal: TermSignal) -> Result<bool>;
    fn group_alive(&self, pgid: u32) -> bool;
}

/// Process table backed by the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProcessTable;

#[cfg(unix)]
mod host {
    use std::fs;
    use std::path::PathBuf;

    use anyhow::{Context, Result, anyhow};
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::{Pid, getpgid};
    use tracing::{debug, warn};

    use super::{HostProcessTable, ProcessTable, TermSignal};
    use crate::core::ownership::ProcessSnapshot;

    /// PIDs that must never be targeted.
    const PROTECTED_PIDS: [i32; 2] = [0, 1];

    fn to_pid(raw: u32) -> Result<Pid> {
        let pid = i32::try_from(raw).with_context(|| format!("pid {raw} out of range"))?;
        if PROTECTED_PIDS.contains(&pid) {
            return Err(anyhow!("refusing to target protected pid {pid}"));
        }
        Ok(Pid::from_raw(pid))
    }

    /// Collect exit statuses of our own exited children so they stop showing up as alive.
    fn reap(target: Pid) {
        loop {
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => debug!(?status, "reaped child"),
            }
            if target.as_raw() > 0 {
                break;
            }
        }
    }

    impl ProcessTable for HostProcessTable {
        fn snapshot(&self, raw_pid: u32) -> Result<Option<ProcessSnapshot>> {
            let pid = to_pid(raw_pid)?;
            if !self.is_alive(raw_pid) {
                return Ok(None);
            }
            let pgid = getpgid(Some(pid))
                .ok()
                .and_then(|g| u32::try_from(g.as_raw()).ok());
            Ok(Some(ProcessSnapshot {
                pid: raw_pid,
                pgid,
                cwd: process_cwd(raw_pid),
                cmdline: process_cmdline(raw_pid),
                listening_ports: listening_ports(raw_pid),
            }))
        }

        fn is_alive(&self, raw_pid: u32) -> bool {
            let Ok(pid) = to_pid(raw_pid) else {
                return false;
            };
            reap(pid);
            match kill(pid, None) {
                Ok(()) | Err(Errno::EPERM) => !is_zombie(raw_pid),
                Err(_) => false,
            }
        }

        fn signal_group(&self, raw_pgid: u32, signal: TermSignal) -> Result<bool> {
            let pgid = to_pid(raw_pgid)?;
            let sig = match signal {
                TermSignal::Terminate => Signal::SIGTERM,
                TermSignal::Kill => Signal::SIGKILL,
            };
            match killpg(pgid, sig) {
                Ok(()) => {
                    debug!(pgid = raw_pgid, signal = ?sig, "signal sent to group");
                    Ok(true)
                }
                Err(Errno::ESRCH) => {
                    debug!(pgid = raw_pgid, signal = ?sig, "group already gone (ESRCH)");
                    Ok(false)
                }
                Err(Errno::EPERM) => {
                    warn!(pgid = raw_pgid, signal = ?sig, "permission denied (EPERM)");
                    Err(anyhow!("permission denied signalling process group {raw_pgid}"))
                }
                Err(e) => Err(anyhow!("failed to send {sig:?} to process group {raw_pgid}: {e}")),
            }
        }

        fn group_alive(&self, raw_pgid: u32) -> bool {
            let Ok(pgid) = to_pid(raw_pgid) else {
                return false;
            };
            reap(Pid::from_raw(-pgid.as_raw()));
            matches!(killpg(pgid, None), Ok(()) | Err(Errno::EPERM))
        }
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| super::parse_stat_state(&stat))
            .is_some_and(|state| state == 'Z' || state == 'X')
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: u32) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    fn process_cwd(pid: u32) -> Option<PathBuf> {
        fs::read_link(format!("/proc/{pid}/cwd")).ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn process_cwd(_pid: u32) -> Option<PathBuf> {
        None
    }

    #[cfg(target_os = "linux")]
    fn process_cmdline(pid: u32) -> String {
        let raw = fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
        let cmdline = super::join_cmdline(&raw);
        if !cmdline.is_empty() {
            return cmdline;
        }
        fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|comm| comm.trim().to_string())
            .unwrap_or_default()
    }

    #[cfg(not(target_os = "linux"))]
    fn process_cmdline(pid: u32) -> String {
        std::process::Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .unwrap_or_default()
    }

    #[cfg(target_os = "linux")]
    fn listening_ports(pid: u32) -> Vec<u16> {
        let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
            return Vec::new();
        };
        let inodes: Vec<u64> = fds
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter_map(|target| super::parse_socket_inode(&target.to_string_lossy()))
            .collect();
        if inodes.is_empty() {
            return Vec::new();
        }
        let mut ports: Vec<u16> = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .flat_map(|table| super::parse_listen_sockets(&table))
            .filter(|(inode, _)| inodes.contains(inode))
            .map(|(_, port)| port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    #[cfg(not(target_os = "linux"))]
    fn listening_ports(_pid: u32) -> Vec<u16> {
        Vec::new()
    }
}

#[cfg(not(unix))]
impl ProcessTable for HostProcessTable {
    fn snapshot(&self, _pid: u32) -> Result<Option<ProcessSnapshot>> {
        Err(anyhow::anyhow!("process inspection is not supported on this platform"))
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn signal_group(&self, _pgid: u32, _signal: TermSignal) -> Result<bool> {
        Err(anyhow::anyhow!("process signalling is not supported on this platform"))
    }

    fn group_alive(&self, _pgid: u32) -> bool {
        false
    }
}

/// State letter from `/proc/<pid>/stat` (the field after the parenthesised command).
fn parse_stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// NUL-separated argv joined by spaces.
fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inode from an fd link target such as `socket:[12345]`.
fn parse_socket_inode(target: &str) -> Option<u64> {
    target.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// `(inode, port)` for every LISTEN row of a `/proc/net/tcp{,6}` table.
fn parse_listen_sockets(table: &str) -> Vec<(u64, u16)> {
    const TCP_LISTEN: &str = "0A";
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some((inode, port))
        })
        .collect()
}
