//! Ownership verification for tracked server processes.
//!
//! A process is only ever signalled after [`verify_ownership`] returns
//! [`Ownership::Owned`]. Protected services win over every ownership signal.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::core::types::Deployment;

/// Point-in-time view of a live process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub pgid: Option<u32>,
    pub cwd: Option<PathBuf>,
    /// Arguments joined by spaces.
    pub cmdline: String,
    pub listening_ports: Vec<u16>,
}

/// Host services that must never be signalled.
#[derive(Debug, Clone, Default)]
pub struct ProtectionRules {
    pub keywords: Vec<String>,
    pub reserved_ports: BTreeSet<u16>,
}

impl ProtectionRules {
    /// Why `snapshot` is protected, or `None`.
    pub fn protection_reason(&self, snapshot: &ProcessSnapshot) -> Option<String> {
        let cmdline = snapshot.cmdline.to_ascii_lowercase();
        if let Some(keyword) = self
            .keywords
            .iter()
            .find(|k| !k.is_empty() && cmdline.contains(&k.to_ascii_lowercase()))
        {
            return Some(format!("command line matches protected keyword '{keyword}'"));
        }
        snapshot
            .listening_ports
            .iter()
            .find(|port| self.reserved_ports.contains(port))
            .map(|port| format!("process listens on reserved port {port}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipBasis {
    ProcessGroup,
    WorkingDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Owned(OwnershipBasis),
    NotOwned,
    Protected { reason: String },
}

impl Ownership {
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

/// Decide whether the process in `snapshot` belongs to `deployment`.
///
/// Owned when the process group captured at spawn time still matches, or when
/// the process runs inside the deployment directory.
pub fn verify_ownership(
    snapshot: &ProcessSnapshot,
    deployment: &Deployment,
    rules: &ProtectionRules,
) -> Ownership {
    if let Some(reason) = rules.protection_reason(snapshot) {
        return Ownership::Protected { reason };
    }
    if snapshot.pid != deployment.process_id {
        return Ownership::NotOwned;
    }
    if snapshot.pgid == Some(deployment.process_group_id) {
        return Ownership::Owned(OwnershipBasis::ProcessGroup);
    }
    if snapshot
        .cwd
        .as_deref()
        .is_some_and(|cwd| cwd.starts_with(&deployment.directory))
    {
        return Ownership::Owned(OwnershipBasis::WorkingDirectory);
    }
    Ownership::NotOwned
}
