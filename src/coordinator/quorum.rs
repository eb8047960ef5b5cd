//! Quorum gate
//!
//! Tracks the live members of a logical service and hands out a quorum
//! token. The token increases by one every time membership goes from below
//! the replication factor to at least the replication factor, so a token
//! names one contiguous quorate epoch. It never moves backwards: writers
//! compare tokens to detect a lose-then-regain cycle.

use crate::common::{Error, Result};
use crate::coordination::{CoordinationClient, EventKind, SessionFactory, SessionId, WatchKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Token value before quorum was ever met
pub const NO_QUORUM: u64 = 0;

const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuorumState {
    pub token: u64,
    pub quorate: bool,
    pub members: BTreeSet<String>,
}

pub struct QuorumGate {
    replication_factor: usize,
    state: watch::Sender<QuorumState>,
}

impl QuorumGate {
    pub fn new(replication_factor: usize) -> Result<Self> {
        if replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication factor must be at least 1".into(),
            ));
        }
        let (state, _) = watch::channel(QuorumState::default());
        Ok(Self {
            replication_factor,
            state,
        })
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn current_token(&self) -> u64 {
        self.state.borrow().token
    }

    pub fn is_quorate(&self) -> bool {
        self.state.borrow().quorate
    }

    pub fn state(&self) -> QuorumState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QuorumState> {
        self.state.subscribe()
    }

    /// Replace the member set with the store's current view.
    pub fn on_membership_change<I>(&self, members: I) -> QuorumState
    where
        I: IntoIterator<Item = String>,
    {
        let members: BTreeSet<String> = members.into_iter().collect();
        let met = members.len() >= self.replication_factor;
        let replication_factor = self.replication_factor;

        let mut snapshot = QuorumState::default();
        self.state.send_modify(|state| {
            if met && !state.quorate {
                state.token += 1;
                tracing::info!(
                    "Quorum met ({}/{}), token {}",
                    members.len(),
                    replication_factor,
                    state.token
                );
            } else if !met && state.quorate {
                tracing::warn!(
                    "Quorum lost ({}/{}), token {} retired",
                    members.len(),
                    replication_factor,
                    state.token
                );
            }
            state.quorate = met;
            state.members = members;
            snapshot = state.clone();
        });
        snapshot
    }

    /// Drop quorate state derived from a session that is no longer valid.
    /// The token is kept; the next quorum opens a new epoch.
    pub fn invalidate(&self, reason: &str) {
        self.state.send_modify(|state| {
            if state.quorate {
                tracing::warn!("Quorum invalidated: {}", reason);
            }
            state.quorate = false;
            state.members.clear();
        });
    }

    /// Wait until quorum is met and return its token.
    pub async fn await_quorum(&self, timeout: Duration) -> Result<u64> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| s.quorate).await.map(|s| s.token)
        })
        .await;

        match waited {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(_)) => Err(Error::Internal("quorum gate dropped".into())),
            Err(_) => Err(Error::Timeout(format!(
                "quorum of {} not met within {:?} ({} live)",
                self.replication_factor,
                timeout,
                self.state.borrow().members.len()
            ))),
        }
    }
}

impl std::fmt::Debug for QuorumGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumGate")
            .field("replication_factor", &self.replication_factor)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Feeds a [`QuorumGate`] from the children of a members node.
/// Aborted on drop.
pub struct QuorumWatcher {
    handle: JoinHandle<()>,
    session: watch::Receiver<Option<SessionId>>,
}

impl QuorumWatcher {
    /// Watch through `client` until its session ends.
    pub fn spawn(
        client: Arc<dyn CoordinationClient>,
        members_path: String,
        gate: Arc<QuorumGate>,
    ) -> Self {
        let (session, rx) = watch::channel(Some(client.session_id()));
        let handle = tokio::spawn(async move {
            watch_members(client, members_path, gate).await;
            session.send_replace(None);
        });
        Self {
            handle,
            session: rx,
        }
    }

    /// Watch through sessions from `connect`, opening a new one whenever
    /// the current session ends. Quorum is re-established from the store's
    /// view after every rejoin, under a new token.
    pub fn reconnecting(connect: SessionFactory, members_path: String, gate: Arc<QuorumGate>) -> Self {
        let (session, rx) = watch::channel(None);
        let handle = tokio::spawn(async move {
            loop {
                let client = connect();
                session.send_replace(Some(client.session_id()));
                tracing::debug!(
                    "Watching {} through session {}",
                    members_path,
                    client.session_id()
                );
                watch_members(client.clone(), members_path.clone(), gate.clone()).await;
                client.close();
                tracing::info!("Rejoining {} with a new session", members_path);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        });
        Self {
            handle,
            session: rx,
        }
    }

    /// Session currently feeding the gate
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for QuorumWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn watch_members(
    client: Arc<dyn CoordinationClient>,
    members_path: String,
    gate: Arc<QuorumGate>,
) {
    loop {
        // watch before listing so a change in between still wakes us
        let changed = match client.watch(&members_path, WatchKind::Children) {
            Ok(rx) => rx,
            Err(Error::NoNode(_)) => {
                gate.on_membership_change(Vec::new());
                match client.watch(&members_path, WatchKind::Data) {
                    Ok(created) => {
                        if client.exists(&members_path).unwrap_or(false) {
                            continue;
                        }
                        let _ = created.await;
                        continue;
                    }
                    Err(e) => {
                        if stop_on(&gate, &e) {
                            return;
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
            }
            Err(e) => {
                if stop_on(&gate, &e) {
                    return;
                }
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        match client.get_children(&members_path) {
            Ok(children) => {
                gate.on_membership_change(children);
            }
            Err(e) => {
                if stop_on(&gate, &e) {
                    return;
                }
            }
        }

        match changed.await {
            Ok(event) if matches!(
                event.kind,
                EventKind::SessionExpired | EventKind::SessionClosed
            ) =>
            {
                gate.invalidate("coordination session ended");
                return;
            }
            Ok(_) => {}
            Err(_) => {
                gate.invalidate("watch dropped");
                return;
            }
        }
    }
}

/// Log `e`; returns true when the watcher must stop.
fn stop_on(gate: &QuorumGate, e: &Error) -> bool {
    if e.invalidates_session_state() {
        gate.invalidate(&e.to_string());
        true
    } else {
        tracing::warn!("Quorum watcher error: {}", e);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{ensure_path, CreateMode, MemoryEnsemble};

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rejects_zero_factor() {
        assert!(QuorumGate::new(0).is_err());
    }

    #[test]
    fn test_token_advances_on_each_epoch() {
        let gate = QuorumGate::new(3).unwrap();
        assert_eq!(gate.current_token(), NO_QUORUM);

        gate.on_membership_change(members(&["a", "b"]));
        assert_eq!(gate.current_token(), NO_QUORUM);
        assert!(!gate.is_quorate());

        gate.on_membership_change(members(&["a", "b", "c"]));
        assert_eq!(gate.current_token(), 1);

        // staying quorate keeps the epoch
        gate.on_membership_change(members(&["a", "b", "c", "d"]));
        gate.on_membership_change(members(&["a", "c", "d"]));
        assert_eq!(gate.current_token(), 1);

        gate.on_membership_change(members(&["a", "c"]));
        assert!(!gate.is_quorate());
        assert_eq!(gate.current_token(), 1);

        gate.on_membership_change(members(&["a", "c", "e"]));
        assert_eq!(gate.current_token(), 2);
    }

    #[test]
    fn test_tokens_never_decrease() {
        let gate = QuorumGate::new(2).unwrap();
        let sequences: [&[&str]; 7] = [
            &["a"],
            &["a", "b"],
            &[],
            &["b", "c"],
            &["c"],
            &["c", "d", "e"],
            &["a"],
        ];
        let mut last = gate.current_token();
        for step in sequences {
            gate.on_membership_change(members(step));
            let token = gate.current_token();
            assert!(token >= last);
            last = token;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn test_singleton_quorum() {
        let gate = QuorumGate::new(1).unwrap();
        gate.on_membership_change(members(&["only"]));
        assert_eq!(gate.await_quorum(Duration::from_millis(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_await_quorum_times_out_below_factor() {
        let gate = QuorumGate::new(2).unwrap();
        gate.on_membership_change(members(&["a"]));
        let err = gate
            .await_quorum(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_await_quorum_wakes_on_change() {
        let gate = Arc::new(QuorumGate::new(2).unwrap());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_quorum(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.on_membership_change(members(&["a", "b"]));
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[test]
    fn test_invalidate_keeps_token() {
        let gate = QuorumGate::new(1).unwrap();
        gate.on_membership_change(members(&["a"]));
        gate.invalidate("session expired");
        assert!(!gate.is_quorate());
        assert_eq!(gate.current_token(), 1);
        gate.on_membership_change(members(&["a"]));
        assert_eq!(gate.current_token(), 2);
    }

    #[tokio::test]
    async fn test_watcher_tracks_members_node() {
        let ensemble = MemoryEnsemble::new();
        let observer: Arc<dyn CoordinationClient> = Arc::new(ensemble.connect());
        ensure_path(&*observer, "/svc/members").unwrap();

        let gate = Arc::new(QuorumGate::new(2).unwrap());
        let _watcher = QuorumWatcher::spawn(observer.clone(), "/svc/members".into(), gate.clone());

        let a = ensemble.connect();
        let b = ensemble.connect();
        a.create("/svc/members/a", b"", CreateMode::Ephemeral).unwrap();
        b.create("/svc/members/b", b"", CreateMode::Ephemeral).unwrap();
        let t0 = gate.await_quorum(Duration::from_secs(5)).await.unwrap();

        b.close();
        let mut rx = gate.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.quorate))
            .await
            .unwrap()
            .unwrap();

        let c = ensemble.connect();
        c.create("/svc/members/c", b"", CreateMode::Ephemeral).unwrap();
        let t1 = gate.await_quorum(Duration::from_secs(5)).await.unwrap();
        assert!(t1 > t0);
    }

    #[tokio::test]
    async fn test_reconnecting_watcher_regains_quorum() {
        let ensemble = MemoryEnsemble::new();
        let member = ensemble.connect();
        ensure_path(&member, "/svc/members").unwrap();
        member
            .create("/svc/members/a", b"", CreateMode::Ephemeral)
            .unwrap();

        let gate = Arc::new(QuorumGate::new(1).unwrap());
        let watcher = QuorumWatcher::reconnecting(
            ensemble.session_factory(),
            "/svc/members".into(),
            gate.clone(),
        );
        let t0 = gate.await_quorum(Duration::from_secs(5)).await.unwrap();
        let first = watcher.session_id().unwrap();

        ensemble.expire(first);
        let mut rx = gate.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.quorate && s.token > t0),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!watcher.is_finished());
        assert_ne!(watcher.session_id(), Some(first));
        assert!(member.is_connected());
    }

    #[tokio::test]
    async fn test_watcher_invalidates_on_session_expiry() {
        let ensemble = MemoryEnsemble::new();
        let observer = ensemble.connect();
        let observer_id = observer.session_id();
        let observer: Arc<dyn CoordinationClient> = Arc::new(observer);
        ensure_path(&*observer, "/svc/members").unwrap();
        observer
            .create("/svc/members/x", b"", CreateMode::Persistent)
            .unwrap();

        let gate = Arc::new(QuorumGate::new(1).unwrap());
        let watcher = QuorumWatcher::spawn(observer, "/svc/members".into(), gate.clone());
        gate.await_quorum(Duration::from_secs(5)).await.unwrap();

        ensemble.expire(observer_id);
        let mut rx = gate.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.quorate))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(watcher.is_finished());
    }
}
