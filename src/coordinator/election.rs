//! Master election over sequential ephemeral nodes
//!
//! Each contender creates `contender<seq>` under the election node. The
//! live contender with the lowest sequence is master. Nothing stores "I am
//! master": it is recomputed from the children list every time the children
//! watch fires, and dropped as soon as the contender's session ends.

use crate::common::{Error, Result};
use crate::coordination::{
    ensure_path, join_path, node_name, sequence_of, CoordinationClient, CreateMode, EventKind,
    SessionState, WatchKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const CONTENDER_PREFIX: &str = "contender";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leadership {
    /// Not evaluated yet
    Pending,
    Master,
    Follower { master: String },
    /// Session ended or the contender node is gone; must rejoin
    Invalidated,
}

/// Name of the lowest-sequence contender among `children`.
pub fn elect(children: &[String]) -> Option<&str> {
    children
        .iter()
        .filter_map(|name| sequence_of(name).map(|seq| (seq, name.as_str())))
        .min_by_key(|(seq, _)| *seq)
        .map(|(_, name)| name)
}

pub struct Contender {
    client: Arc<dyn CoordinationClient>,
    election_path: String,
    node_path: String,
    node_name: String,
    leadership: watch::Receiver<Leadership>,
    task: JoinHandle<()>,
}

impl Contender {
    /// Register as a contender and start following the election.
    pub fn join(
        client: Arc<dyn CoordinationClient>,
        election_path: &str,
        payload: &[u8],
    ) -> Result<Self> {
        ensure_path(&*client, election_path)?;
        let node_path = client.create(
            &join_path(election_path, CONTENDER_PREFIX),
            payload,
            CreateMode::EphemeralSequential,
        )?;
        let node_name = node_name(&node_path).to_string();
        tracing::debug!("Joined election {} as {}", election_path, node_name);

        let (tx, leadership) = watch::channel(Leadership::Pending);
        let task = tokio::spawn(follow_election(
            client.clone(),
            election_path.to_string(),
            node_name.clone(),
            tx,
        ));

        Ok(Self {
            client,
            election_path: election_path.to_string(),
            node_path,
            node_name,
            leadership,
            task,
        })
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    pub fn sequence(&self) -> Option<u64> {
        sequence_of(&self.node_name)
    }

    /// Last computed leadership; eventually consistent.
    pub fn leadership(&self) -> Leadership {
        self.leadership.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.leadership.clone()
    }

    pub fn is_master(&self) -> bool {
        self.client.is_connected() && *self.leadership.borrow() == Leadership::Master
    }

    /// Wait until this contender is master.
    pub async fn await_master(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.leadership.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|l| matches!(l, Leadership::Master | Leadership::Invalidated))
                .await
                .map(|l| (*l).clone())
        })
        .await;
        match waited {
            Ok(Ok(Leadership::Master)) => Ok(()),
            Ok(_) => Err(Error::SessionExpired(format!(
                "{} can no longer become master",
                self.node_name
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "{} not master within {:?}",
                self.node_name, timeout
            ))),
        }
    }

    /// Re-validate leadership against the store. Call before every
    /// leader-only operation; the cached view may be stale.
    pub fn ensure_master(&self) -> Result<()> {
        if !self.client.is_connected() {
            return Err(Error::SessionExpired(self.client.session_id().to_string()));
        }
        let children = self.client.get_children(&self.election_path)?;
        if !children.iter().any(|c| c == &self.node_name) {
            return Err(Error::NotMaster("none (contender node gone)".into()));
        }
        match elect(&children) {
            Some(master) if master == self.node_name => Ok(()),
            Some(master) => Err(Error::NotMaster(master.to_string())),
            None => Err(Error::NotMaster("none".into())),
        }
    }

    /// Leave the election. Deleting the node hands leadership to the next
    /// contender.
    pub fn resign(self) -> Result<()> {
        self.task.abort();
        match self.client.delete(&self.node_path) {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Contender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Contender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contender")
            .field("node_path", &self.node_path)
            .field("leadership", &*self.leadership.borrow())
            .finish()
    }
}

async fn follow_election(
    client: Arc<dyn CoordinationClient>,
    election_path: String,
    me: String,
    tx: watch::Sender<Leadership>,
) {
    let mut session = client.session_state();
    loop {
        let changed = match client.watch(&election_path, WatchKind::Children) {
            Ok(rx) => rx,
            Err(e) => {
                invalidate(&tx, &me, &e.to_string());
                return;
            }
        };
        let children = match client.get_children(&election_path) {
            Ok(children) => children,
            Err(e) => {
                invalidate(&tx, &me, &e.to_string());
                return;
            }
        };

        let next = if !children.iter().any(|c| c == &me) {
            Leadership::Invalidated
        } else {
            match elect(&children) {
                Some(master) if master == me => Leadership::Master,
                Some(master) => Leadership::Follower {
                    master: master.to_string(),
                },
                None => Leadership::Invalidated,
            }
        };

        if next == Leadership::Invalidated {
            invalidate(&tx, &me, "contender node vanished");
            return;
        }
        tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match &next {
                Leadership::Master => tracing::info!("{} is now master of {}", me, election_path),
                Leadership::Follower { master } => {
                    tracing::info!("{} follows master {}", me, master)
                }
                _ => {}
            }
            *current = next.clone();
            true
        });

        let session_ended = async {
            let _ = session
                .wait_for(|s| *s != SessionState::Connected)
                .await
                .map(|_| ());
        };
        tokio::select! {
            event = changed => match event {
                Ok(event) if matches!(
                    event.kind,
                    EventKind::SessionExpired | EventKind::SessionClosed
                ) => {
                    invalidate(&tx, &me, "coordination session ended");
                    return;
                }
                Ok(_) => continue,
                Err(_) => {
                    invalidate(&tx, &me, "election watch dropped");
                    return;
                }
            },
            _ = session_ended => {
                invalidate(&tx, &me, "coordination session ended");
                return;
            }
        }
    }
}

fn invalidate(tx: &watch::Sender<Leadership>, me: &str, reason: &str) {
    let was_master = *tx.borrow() == Leadership::Master;
    if was_master {
        tracing::warn!("{} relinquishes mastership: {}", me, reason);
    } else {
        tracing::debug!("{} leaves election: {}", me, reason);
    }
    tx.send_replace(Leadership::Invalidated);
}
