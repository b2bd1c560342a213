//! In-memory registry of live deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use crate::core::types::{Deployment, DeploymentId};

/// Deployment records keyed by id.
///
/// Readers always see whole records: inserts and removals replace an entry
/// under the write lock, and reads clone out of the read lock.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: RwLock<BTreeMap<DeploymentId, Deployment>>,
    last_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id: the current epoch milliseconds, bumped past the last id handed out.
    pub fn next_id(&self) -> DeploymentId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last_id
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return DeploymentId(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn insert(&self, deployment: Deployment) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(deployment.id, deployment);
    }

    pub fn get(&self, id: DeploymentId) -> Option<Deployment> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&id).cloned()
    }

    pub fn remove(&self, id: DeploymentId) -> Option<Deployment> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&id)
    }

    /// All records in id order.
    pub fn snapshot(&self) -> Vec<Deployment> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::core::types::ServerKind;

    fn record(id: DeploymentId) -> Deployment {
        Deployment {
            id,
            directory: PathBuf::from(format!("/tmp/web_{id}")),
            port: 8080,
            process_id: 10,
            process_group_id: 10,
            server_kind: ServerKind::Static,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let registry = ProcessRegistry::new();
        let ids: Vec<_> = (0..100).map(|_| registry.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let registry = Arc::new(ProcessRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || (0..50).map(|_| registry.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = BTreeSet::new();
        for handle in handles {
            for id in handle.join().expect("join") {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn insert_get_remove() {
        let registry = ProcessRegistry::new();
        let id = registry.next_id();
        registry.insert(record(id));
        assert_eq!(registry.get(id).map(|d| d.id), Some(id));
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.snapshot().is_empty());
    }
}
