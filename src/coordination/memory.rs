//! In-process coordination ensemble
//!
//! Holds the full node tree behind one mutex. Every [`MemorySession`] is a
//! client session: ephemeral nodes it creates are owned by it and vanish
//! when it is closed or expired, which fires the usual watches for every
//! other session.

use super::{
    join_path, node_name, parent_path, validate_path, CoordinationClient, CreateMode, EventKind,
    SessionFactory, SessionId, SessionState, WatchEvent, WatchKind, SEQUENCE_DIGITS,
};
use crate::common::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};

struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

struct PendingWatch {
    path: String,
    kind: WatchKind,
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

struct EnsembleState {
    nodes: HashMap<String, Node>,
    sessions: HashMap<SessionId, watch::Sender<SessionState>>,
    watches: Vec<PendingWatch>,
    next_session: u64,
}

impl EnsembleState {
    fn check_session(&self, session: SessionId) -> Result<()> {
        match self.sessions.get(&session).map(|s| *s.borrow()) {
            Some(SessionState::Connected) => Ok(()),
            _ => Err(Error::SessionExpired(session.to_string())),
        }
    }

    fn fire(&mut self, path: &str, kind: WatchKind, event: EventKind) {
        let mut kept = Vec::with_capacity(self.watches.len());
        for watch in self.watches.drain(..) {
            if watch.tx.is_closed() {
                continue;
            }
            if watch.path == path && watch.kind == kind {
                let _ = watch.tx.send(WatchEvent {
                    path: path.to_string(),
                    kind: event,
                });
            } else {
                kept.push(watch);
            }
        }
        self.watches = kept;
    }

    fn remove_node(&mut self, path: &str) -> Result<()> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);

        if let Some(parent) = parent_path(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.remove(node_name(path));
            }
            self.fire(path, WatchKind::Data, EventKind::NodeDeleted);
            self.fire(path, WatchKind::Children, EventKind::NodeDeleted);
            self.fire(parent, WatchKind::Children, EventKind::ChildrenChanged);
        }
        Ok(())
    }

    fn end_session(&mut self, session: SessionId, end: SessionState) {
        let Some(state) = self.sessions.get(&session) else {
            return;
        };
        if *state.borrow() != SessionState::Connected {
            return;
        }
        state.send_replace(end);

        let event = match end {
            SessionState::Expired => EventKind::SessionExpired,
            _ => EventKind::SessionClosed,
        };
        let (mine, others): (Vec<_>, Vec<_>) = self
            .watches
            .drain(..)
            .filter(|w| !w.tx.is_closed())
            .partition(|w| w.session == session);
        self.watches = others;
        for watch in mine {
            let _ = watch.tx.send(WatchEvent {
                path: watch.path,
                kind: event,
            });
        }

        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort();
        tracing::debug!(
            "Session {} ended ({:?}), removing {} ephemeral node(s)",
            session,
            end,
            owned.len()
        );
        for path in owned {
            if let Err(e) = self.remove_node(&path) {
                tracing::warn!("Failed to remove ephemeral {}: {}", path, e);
            }
        }

        // clients keep the final state through their receivers
        self.sessions.remove(&session);
    }
}

/// Shared in-process coordination store
#[derive(Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                sessions: HashMap::new(),
                watches: Vec::new(),
                next_session: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new client session
    pub fn connect(&self) -> MemorySession {
        let mut state = self.lock();
        let id = SessionId(state.next_session);
        state.next_session += 1;
        let (tx, rx) = watch::channel(SessionState::Connected);
        state.sessions.insert(id, tx);
        tracing::debug!("Session {} connected", id);
        MemorySession {
            id,
            ensemble: self.clone(),
            state: rx,
        }
    }

    /// Factory handing out new sessions of this ensemble
    pub fn session_factory(&self) -> SessionFactory {
        let ensemble = self.clone();
        Arc::new(move || Arc::new(ensemble.connect()) as Arc<dyn CoordinationClient>)
    }

    /// Expire a session as if the server stopped hearing from it.
    pub fn expire(&self, session: SessionId) {
        tracing::warn!("Expiring session {}", session);
        self.lock().end_session(session, SessionState::Expired);
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| *s.borrow() == SessionState::Connected)
            .count()
    }
}

/// A client session of a [`MemoryEnsemble`]
pub struct MemorySession {
    id: SessionId,
    ensemble: MemoryEnsemble,
    state: watch::Receiver<SessionState>,
}

impl CoordinationClient for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;

        let mut state = self.ensemble.lock();
        state.check_session(self.id)?;

        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::NoNode(parent.to_string()))?;
        if parent_node.owner.is_some() {
            return Err(Error::Other(format!(
                "ephemeral node {} cannot have children",
                parent
            )));
        }

        let name = if mode.is_sequential() {
            format!(
                "{}{:0width$}",
                node_name(path),
                parent_node.next_sequence,
                width = SEQUENCE_DIGITS
            )
        } else {
            node_name(path).to_string()
        };
        if parent_node.children.contains(&name) {
            return Err(Error::NodeExists(join_path(parent, &name)));
        }
        parent_node.next_sequence += 1;
        parent_node.children.insert(name.clone());

        let actual = join_path(parent, &name);
        let owner = mode.is_ephemeral().then_some(self.id);
        state
            .nodes
            .insert(actual.clone(), Node::new(data.to_vec(), owner));

        state.fire(&actual, WatchKind::Data, EventKind::NodeCreated);
        state.fire(parent, WatchKind::Children, EventKind::ChildrenChanged);
        Ok(actual)
    }

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.ensemble.lock();
        state.check_session(self.id)?;
        Ok(state.nodes.get(path).map(|n| n.data.clone()))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.ensemble.lock();
        state.check_session(self.id)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        state.fire(path, WatchKind::Data, EventKind::DataChanged);
        Ok(())
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.ensemble.lock();
        state.check_session(self.id)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        Ok(node.children.iter().cloned().collect())
    }

    fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::Other("cannot delete the root node".into()));
        }
        let mut state = self.ensemble.lock();
        state.check_session(self.id)?;
        state.remove_node(path)
    }

    fn watch(&self, path: &str, kind: WatchKind) -> Result<oneshot::Receiver<WatchEvent>> {
        let mut state = self.ensemble.lock();
        state.check_session(self.id)?;
        if kind == WatchKind::Children && !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        state.watches.retain(|w| !w.tx.is_closed());
        let (tx, rx) = oneshot::channel();
        state.watches.push(PendingWatch {
            path: path.to_string(),
            kind,
            session: self.id,
            tx,
        });
        Ok(rx)
    }

    fn close(&self) {
        self.ensemble
            .lock()
            .end_session(self.id, SessionState::Closed);
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ensure_path;

    #[test]
    fn test_create_and_read() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();

        s.create("/a", b"one", CreateMode::Persistent).unwrap();
        assert_eq!(s.get_data("/a").unwrap().unwrap(), b"one");
        assert!(s.get_data("/missing").unwrap().is_none());
        assert!(matches!(
            s.create("/a", b"two", CreateMode::Persistent),
            Err(Error::NodeExists(_))
        ));
        assert!(matches!(
            s.create("/x/y", b"", CreateMode::Persistent),
            Err(Error::NoNode(_))
        ));
    }

    #[test]
    fn test_sequential_names_are_monotonic() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();
        ensure_path(&s, "/election").unwrap();

        let a = s
            .create("/election/c", b"", CreateMode::EphemeralSequential)
            .unwrap();
        let b = s
            .create("/election/c", b"", CreateMode::EphemeralSequential)
            .unwrap();
        assert_eq!(a, "/election/c0000000000");
        assert_eq!(b, "/election/c0000000001");

        s.delete(&a).unwrap();
        let c = s
            .create("/election/c", b"", CreateMode::EphemeralSequential)
            .unwrap();
        assert_eq!(c, "/election/c0000000002");
    }

    #[test]
    fn test_delete_requires_empty() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();
        ensure_path(&s, "/a/b").unwrap();
        assert!(matches!(s.delete("/a"), Err(Error::NotEmpty(_))));
        s.delete("/a/b").unwrap();
        s.delete("/a").unwrap();
        assert!(!s.exists("/a").unwrap());
    }

    #[test]
    fn test_ephemerals_removed_on_close() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let observer = ensemble.connect();
        ensure_path(&owner, "/members").unwrap();
        owner
            .create("/members/m", b"", CreateMode::Ephemeral)
            .unwrap();
        assert_eq!(observer.get_children("/members").unwrap(), vec!["m"]);

        owner.close();
        assert!(observer.get_children("/members").unwrap().is_empty());
        assert!(matches!(
            owner.get_data("/members"),
            Err(Error::SessionExpired(_))
        ));
        assert_eq!(ensemble.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_children_watch_fires_once() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let observer = ensemble.connect();
        ensure_path(&owner, "/members").unwrap();

        let rx = observer.watch("/members", WatchKind::Children).unwrap();
        owner
            .create("/members/m", b"", CreateMode::Ephemeral)
            .unwrap();
        let event = rx.await.unwrap();
        assert_eq!(event.kind, EventKind::ChildrenChanged);
        assert_eq!(event.path, "/members");

        // one-shot: a second change needs a new watch
        let rx = observer.watch("/members", WatchKind::Children).unwrap();
        ensemble.expire(owner.session_id());
        assert_eq!(rx.await.unwrap().kind, EventKind::ChildrenChanged);
    }

    #[tokio::test]
    async fn test_data_watch_on_absent_node() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();
        let rx = s.watch("/later", WatchKind::Data).unwrap();
        s.create("/later", b"x", CreateMode::Persistent).unwrap();
        assert_eq!(rx.await.unwrap().kind, EventKind::NodeCreated);

        let rx = s.watch("/later", WatchKind::Data).unwrap();
        s.set_data("/later", b"y").unwrap();
        assert_eq!(rx.await.unwrap().kind, EventKind::DataChanged);
    }

    #[tokio::test]
    async fn test_expiry_notifies_own_watches() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();
        ensure_path(&s, "/members").unwrap();
        let rx = s.watch("/members", WatchKind::Children).unwrap();
        let mut state = s.session_state();

        ensemble.expire(s.session_id());
        assert_eq!(rx.await.unwrap().kind, EventKind::SessionExpired);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), SessionState::Expired);
        assert!(!s.is_connected());
    }

    #[test]
    fn test_ended_sessions_and_dropped_watches_are_pruned() {
        let ensemble = MemoryEnsemble::new();
        let keeper = ensemble.connect();
        let transient = ensemble.connect();
        ensure_path(&keeper, "/quiet").unwrap();

        // watches on a node that never changes, abandoned by their callers
        for _ in 0..16 {
            drop(keeper.watch("/quiet", WatchKind::Data).unwrap());
        }
        let kept = keeper.watch("/quiet", WatchKind::Children).unwrap();
        assert_eq!(ensemble.lock().watches.len(), 1);
        drop(keeper.watch("/quiet", WatchKind::Data).unwrap());
        assert_eq!(ensemble.lock().watches.len(), 2);

        transient.close();
        ensemble.expire(transient.session_id());
        assert_eq!(ensemble.lock().sessions.len(), 1);
        assert_eq!(ensemble.lock().watches.len(), 1);
        assert!(!transient.is_connected());
        assert!(matches!(
            transient.get_children("/"),
            Err(Error::SessionExpired(_))
        ));

        drop(kept);
        keeper.close();
        assert!(ensemble.lock().sessions.is_empty());
        assert!(ensemble.lock().watches.is_empty());
        assert_eq!(ensemble.live_sessions(), 0);
    }

    #[test]
    fn test_ephemeral_cannot_have_children() {
        let ensemble = MemoryEnsemble::new();
        let s = ensemble.connect();
        s.create("/e", b"", CreateMode::Ephemeral).unwrap();
        assert!(s.create("/e/child", b"", CreateMode::Persistent).is_err());
    }
}
