//! Registry of live supervised processes
//!
//! Supervisors insert themselves on start and remove themselves once on
//! termination. Iteration hands out a snapshot so mass-kill sweeps never
//! race with concurrent removal.

use crate::process::supervisor::ProcessSupervisor;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    live: RwLock<BTreeMap<u64, ProcessSupervisor>>,
    registered: AtomicU64,
    deregistered: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, supervisor: ProcessSupervisor) {
        let id = supervisor.id();
        let mut live = self.inner.live.write().unwrap_or_else(|e| e.into_inner());
        if live.insert(id, supervisor).is_none() {
            self.inner.registered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns false when the supervisor was not registered.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut live = self.inner.live.write().unwrap_or_else(|e| e.into_inner());
        let removed = live.remove(&id).is_some();
        if removed {
            self.inner.deregistered.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!("Supervisor {} was not registered", id);
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the live supervisors
    pub fn snapshot(&self) -> Vec<ProcessSupervisor> {
        self.inner
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Total registrations and deregistrations since creation
    pub fn counts(&self) -> (u64, u64) {
        (
            self.inner.registered.load(Ordering::Relaxed),
            self.inner.deregistered.load(Ordering::Relaxed),
        )
    }

    /// Kill every live process, returning each name with its exit outcome.
    pub async fn kill_all(&self, immediate: bool) -> Vec<(String, Result<i32>)> {
        let victims = self.snapshot();
        tracing::info!("Killing {} supervised process(es)", victims.len());

        let mut results = Vec::with_capacity(victims.len());
        for supervisor in victims {
            let outcome = supervisor.kill(immediate).await;
            results.push((supervisor.name().to_string(), outcome));
        }
        results
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (registered, deregistered) = self.counts();
        f.debug_struct("ServiceRegistry")
            .field("live", &self.len())
            .field("registered", &registered)
            .field("deregistered", &deregistered)
            .finish()
    }
}
