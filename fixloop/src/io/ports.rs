//! TCP port allocation outside the reserved set.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::io::config::DeployConfig;

/// Availability check for a single port.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probe that tries to bind the port on the loopback interface.
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

impl<F: Fn(u16) -> bool + Send + Sync> PortProbe for F {
    fn is_free(&self, port: u16) -> bool {
        self(port)
    }
}

/// How a port was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortGrant {
    Scanned(u16),
    /// The scan found nothing free; the configured last-resort port was used.
    Fallback(u16),
}

impl PortGrant {
    pub fn port(self) -> u16 {
        match self {
            Self::Scanned(port) | Self::Fallback(port) => port,
        }
    }
}

/// Hands out ports from `[base, base + scan_limit)` minus reserved and claimed ones.
///
/// The probe-and-claim step runs under one lock, so concurrent callers never
/// receive the same port. Claims last until [`PortAllocator::release`].
pub struct PortAllocator {
    base: u16,
    scan_limit: u16,
    fallback: u16,
    reserved: BTreeSet<u16>,
    probe: Box<dyn PortProbe>,
    claimed: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(
        base: u16,
        scan_limit: u16,
        fallback: u16,
        reserved: BTreeSet<u16>,
        probe: Box<dyn PortProbe>,
    ) -> Result<Self> {
        if reserved.contains(&fallback) {
            return Err(anyhow!("fallback port {fallback} is reserved"));
        }
        Ok(Self {
            base,
            scan_limit,
            fallback,
            reserved,
            probe,
            claimed: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn from_config(config: &DeployConfig, probe: Box<dyn PortProbe>) -> Result<Self> {
        Self::new(
            config.base_port,
            config.port_scan_limit,
            config.fallback_port,
            config.reserved_ports.clone(),
            probe,
        )
    }

    /// Claim a free port. Errors only when even the fallback port is already claimed.
    pub fn allocate(&self) -> Result<PortGrant> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        let end = self.base.saturating_add(self.scan_limit);
        for port in self.base..end {
            if self.reserved.contains(&port) || claimed.contains(&port) {
                continue;
            }
            if self.probe.is_free(port) {
                claimed.insert(port);
                debug!(port, "allocated port");
                return Ok(PortGrant::Scanned(port));
            }
        }
        if claimed.contains(&self.fallback) {
            return Err(anyhow!(
                "no free port in {}..{} and fallback port {} is in use",
                self.base,
                end,
                self.fallback
            ));
        }
        warn!(
            base = self.base,
            scan_limit = self.scan_limit,
            fallback = self.fallback,
            "port range exhausted, using fallback port"
        );
        claimed.insert(self.fallback);
        Ok(PortGrant::Fallback(self.fallback))
    }

    pub fn release(&self, port: u16) {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        claimed.remove(&port);
    }

    pub fn claimed(&self) -> Vec<u16> {
        let claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        claimed.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn allocator(probe: Box<dyn PortProbe>) -> PortAllocator {
        PortAllocator::new(8000, 5, 9500, BTreeSet::from([8000, 8001]), probe).expect("allocator")
    }

    #[test]
    fn skips_reserved_and_busy_ports() {
        let alloc = allocator(Box::new(|port: u16| port != 8002));
        assert_eq!(alloc.allocate().expect("allocate"), PortGrant::Scanned(8003));
    }

    #[test]
    fn claimed_ports_are_not_handed_out_twice() {
        let alloc = allocator(Box::new(|_: u16| true));
        let first = alloc.allocate().expect("first").port();
        let second = alloc.allocate().expect("second").port();
        assert_ne!(first, second);
        alloc.release(first);
        assert_eq!(alloc.allocate().expect("third").port(), first);
    }

    #[test]
    fn exhausted_range_falls_back_then_errors() {
        let alloc = allocator(Box::new(|_: u16| false));
        assert_eq!(alloc.allocate().expect("fallback"), PortGrant::Fallback(9500));
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn reserved_fallback_is_rejected() {
        let result = PortAllocator::new(8000, 5, 8001, BTreeSet::from([8001]), Box::new(BindProbe));
        assert!(result.is_err());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let alloc = Arc::new(
            PortAllocator::new(20000, 64, 29999, BTreeSet::new(), Box::new(|_: u16| true))
                .expect("allocator"),
        );
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || alloc.allocate().expect("allocate").port())
            })
            .collect();
        let ports: BTreeSet<u16> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(ports.len(), 16);
    }

    #[test]
    fn bind_probe_sees_bound_port_as_busy() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(!BindProbe.is_free(port));
    }
}
