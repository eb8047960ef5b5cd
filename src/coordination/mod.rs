//! Coordination store client abstraction
//!
//! A strongly-consistent hierarchical namespace with persistent and
//! session-scoped (ephemeral) nodes, optional sequence suffixes, and one-shot
//! data/children watches. `memory` provides an in-process ensemble.

pub mod discovery;
pub mod memory;

pub use discovery::{
    await_match, InMemoryDiscovery, RegistrarProbe, ServiceDirectory, ServiceItem,
    ServiceTemplate, UnicastProbe, INSTANCE_ATTRIBUTE,
};
pub use memory::{MemoryEnsemble, MemorySession};

use crate::common::{Error, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Width of the zero-padded sequence suffix appended to sequential nodes
pub const SEQUENCE_DIGITS: usize = 10;

/// Node lifecycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Data,
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    DataChanged,
    ChildrenChanged,
    /// The watching session expired; everything it derived is stale
    SessionExpired,
    /// The watching session was closed by its owner
    SessionClosed,
}

/// One-shot watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Expired,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// One client session against the coordination store.
///
/// All calls are synchronous and may block briefly. Watches are one-shot:
/// the returned receiver resolves on the next matching change, or with a
/// session event when the session ends.
pub trait CoordinationClient: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Create a node, returning its actual path (with sequence suffix).
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Payload of the node, or `None` if it does not exist.
    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Child names (not paths) in lexical order.
    fn get_children(&self, path: &str) -> Result<Vec<String>>;

    fn delete(&self, path: &str) -> Result<()>;

    fn watch(&self, path: &str, kind: WatchKind) -> Result<oneshot::Receiver<WatchEvent>>;

    /// End the session; its ephemeral nodes disappear.
    fn close(&self);

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get_data(path)?.is_some())
    }

    fn is_connected(&self) -> bool {
        *self.session_state().borrow() == SessionState::Connected
    }
}

/// Opens a fresh session, used to rejoin after expiry.
pub type SessionFactory = Arc<dyn Fn() -> Arc<dyn CoordinationClient> + Send + Sync>;

pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::InvalidConfig(format!("invalid node path: {:?}", path)));
    }
    Ok(())
}

pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a node path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a node path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Sequence number carried by a sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_DIGITS {
        return None;
    }
    let suffix = &name[name.len() - SEQUENCE_DIGITS..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Create `path` and any missing ancestors as empty persistent nodes.
/// Concurrent creators are tolerated.
pub fn ensure_path(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    validate_path(path)?;
    if path == "/" || client.exists(path)? {
        return Ok(());
    }
    if let Some(parent) = parent_path(path) {
        ensure_path(client, parent)?;
    }
    match client.create(path, &[], CreateMode::Persistent) {
        Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
