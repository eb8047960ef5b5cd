//! Logical and physical services
//!
//! Namespace layout under the fleet root:
//!
//! ```text
//! <root>/services/<name>                          persistent, service config
//!   logicalService<seq>                           persistent, LogicalServiceNode
//!     physicalServices/instance<seq>              ephemeral, PhysicalServiceNode
//!     members/<service uuid>                      ephemeral, one per joined replica
//!     masterElection/contender<seq>               ephemeral, election contenders
//! ```
//!
//! Every replica gets its own coordination session. Its ephemeral nodes are
//! the liveness proxy: when the session ends, by close or by expiry, they
//! disappear and every watcher sees the replica leave.

use crate::common::{Error, Result};
use crate::coordination::{
    await_match, ensure_path, join_path, node_name, sequence_of, CoordinationClient, CreateMode,
    EventKind, ServiceDirectory, ServiceItem, ServiceTemplate, SessionFactory, SessionId,
    WatchKind, INSTANCE_ATTRIBUTE,
};
use crate::coordinator::election::{elect, Contender, Leadership};
use crate::coordinator::quorum::{QuorumGate, QuorumWatcher};
use crate::process::{CommandSpec, ProcessSupervisor, ServiceRegistry, SupervisorOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub const LOGICAL_PREFIX: &str = "logicalService";
pub const INSTANCE_PREFIX: &str = "instance";
pub const PHYSICAL_SERVICES: &str = "physicalServices";
pub const MEMBERS: &str = "members";
pub const MASTER_ELECTION: &str = "masterElection";

/// Environment variables handed to every replica process
pub const ENV_INSTANCE_PATH: &str = "HAFLEET_INSTANCE_PATH";
pub const ENV_LOGICAL_SERVICE: &str = "HAFLEET_LOGICAL_SERVICE";

/// Payload of `<root>/services/<name>`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceConfigNode {
    replication_factor: usize,
}

/// Payload of a logical service node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalServiceNode {
    pub uuid: Uuid,
    pub replication_factor: usize,
    pub created_at: DateTime<Utc>,
}

/// Payload of a physical service registration node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalServiceNode {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Bound once the replica joins discovery
    #[serde(default)]
    pub service_id: Option<Uuid>,
}

/// A located logical service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalService {
    pub name: String,
    pub path: String,
    pub uuid: Uuid,
    pub replication_factor: usize,
}

impl LogicalService {
    pub fn physical_services_path(&self) -> String {
        join_path(&self.path, PHYSICAL_SERVICES)
    }

    pub fn members_path(&self) -> String {
        join_path(&self.path, MEMBERS)
    }

    pub fn election_path(&self) -> String {
        join_path(&self.path, MASTER_ELECTION)
    }
}

/// Lifecycle of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Process spawned, not yet joined discovery
    Starting,
    Running { service_id: Uuid },
    /// Registration gone: process exited or its session ended
    Gone,
}

/// One replica of a logical service
pub struct PhysicalServiceInstance {
    logical: LogicalService,
    node_path: String,
    supervisor: ProcessSupervisor,
    shared: Arc<InstanceShared>,
}

struct InstanceShared {
    session: Arc<dyn CoordinationClient>,
    state: watch::Sender<InstanceState>,
    contender: OnceLock<Contender>,
}

impl PhysicalServiceInstance {
    pub fn logical(&self) -> &LogicalService {
        &self.logical
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn session(&self) -> &Arc<dyn CoordinationClient> {
        &self.shared.session
    }

    pub fn state(&self) -> InstanceState {
        *self.shared.state.borrow()
    }

    pub fn service_id(&self) -> Option<Uuid> {
        match self.state() {
            InstanceState::Running { service_id } => Some(service_id),
            _ => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        self.state() == InstanceState::Gone
    }

    /// Wait for the replica to join and return its service id.
    pub async fn await_running(&self, timeout: Duration) -> Result<Uuid> {
        let mut rx = self.shared.state.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| *s != InstanceState::Starting)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(InstanceState::Running { service_id })) => Ok(service_id),
            Ok(_) => Err(Error::Other(format!(
                "{} is gone",
                node_name(&self.node_path)
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "{} not running within {:?}",
                node_name(&self.node_path),
                timeout
            ))),
        }
    }

    pub async fn await_gone(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| *s == InstanceState::Gone).await.map(|_| ())
        })
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "{} still registered after {:?}",
                node_name(&self.node_path),
                timeout
            ))
        })?
        .map_err(|_| Error::Internal("instance state dropped".into()))
    }

    pub fn leadership(&self) -> Leadership {
        self.shared
            .contender
            .get()
            .map(Contender::leadership)
            .unwrap_or(Leadership::Pending)
    }

    pub fn is_master(&self) -> bool {
        self.shared
            .contender
            .get()
            .is_some_and(Contender::is_master)
    }

    /// Re-validate mastership before leader-only work.
    pub fn ensure_master(&self) -> Result<()> {
        match self.shared.contender.get() {
            Some(contender) => contender.ensure_master(),
            None => Err(Error::NotMaster(format!(
                "{} has not joined the election",
                node_name(&self.node_path)
            ))),
        }
    }

    /// Kill the replica. Its registration disappears once the process is
    /// reaped.
    pub async fn stop(&self, immediate: bool) -> Result<i32> {
        self.supervisor.kill(immediate).await
    }
}

impl std::fmt::Debug for PhysicalServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalServiceInstance")
            .field("logical", &self.logical.name)
            .field("node_path", &self.node_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Creates and joins logical services and starts their replicas.
pub struct LogicalServiceCoordinator {
    client: RwLock<Arc<dyn CoordinationClient>>,
    reconnect: Option<SessionFactory>,
    directory: Arc<dyn ServiceDirectory>,
    registry: ServiceRegistry,
    root: String,
    hostname: String,
}

impl LogicalServiceCoordinator {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        directory: Arc<dyn ServiceDirectory>,
        registry: ServiceRegistry,
        root: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            client: RwLock::new(client),
            reconnect: None,
            directory,
            registry,
            root: root.into(),
            hostname: hostname.into(),
        }
    }

    /// Replace the coordinator's session through `connect` once it ends.
    /// Quorum watchers rejoin the same way.
    pub fn with_session_factory(mut self, connect: SessionFactory) -> Self {
        self.reconnect = Some(connect);
        self
    }

    /// Current session, reconnecting first if it ended.
    fn client(&self) -> Arc<dyn CoordinationClient> {
        let current = self
            .client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(connect) = self.reconnect.as_ref().filter(|_| !current.is_connected()) else {
            return current;
        };

        let mut slot = self.client.write().unwrap_or_else(|e| e.into_inner());
        if !slot.is_connected() {
            let fresh = connect();
            tracing::warn!(
                "Coordinator session {} ended, continuing as {}",
                slot.session_id(),
                fresh.session_id()
            );
            *slot = fresh;
        }
        slot.clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.client().session_id()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    fn service_path(&self, name: &str) -> String {
        join_path(&join_path(&self.root, "services"), name)
    }

    /// Find the logical service `name`, creating it on first use.
    /// Concurrent creators converge on the lowest-sequence logical node.
    pub fn locate_or_create(&self, name: &str, replication_factor: usize) -> Result<LogicalService> {
        if replication_factor == 0 {
            return Err(Error::InvalidConfig(format!(
                "service {} needs a replication factor of at least 1",
                name
            )));
        }
        let service_path = self.service_path(name);
        let client = self.client();
        ensure_path(&*client, &join_path(&self.root, "services"))?;

        let config = serde_json::to_vec(&ServiceConfigNode { replication_factor })?;
        match client.create(&service_path, &config, CreateMode::Persistent)
        {
            Ok(_) => tracing::info!("Created service config {}", service_path),
            Err(Error::NodeExists(_)) => {
                tracing::debug!("Service config {} already exists", service_path)
            }
            Err(e) => return Err(e),
        }

        let logical = match find_logical(&*client, name, &service_path)? {
            Some(logical) => logical,
            None => {
                let node = LogicalServiceNode {
                    uuid: Uuid::new_v4(),
                    replication_factor,
                    created_at: Utc::now(),
                };
                let created = client.create(
                    &join_path(&service_path, LOGICAL_PREFIX),
                    &serde_json::to_vec(&node)?,
                    CreateMode::PersistentSequential,
                )?;
                let winner = find_logical(&*client, name, &service_path)?.ok_or_else(|| {
                    Error::Internal(format!("logical service {} vanished", created))
                })?;
                if winner.path != created {
                    tracing::info!("Lost creation race for {}, joining {}", name, winner.path);
                    match client.delete(&created) {
                        Ok(()) | Err(Error::NoNode(_)) => {}
                        Err(e) => tracing::warn!("Failed to remove {}: {}", created, e),
                    }
                } else {
                    tracing::info!("Created logical service {} ({})", winner.path, winner.uuid);
                }
                winner
            }
        };

        if logical.replication_factor != replication_factor {
            tracing::warn!(
                "{} has replication factor {}, ignoring requested {}",
                logical.path,
                logical.replication_factor,
                replication_factor
            );
        }

        for container in [
            logical.physical_services_path(),
            logical.members_path(),
            logical.election_path(),
        ] {
            ensure_path(&*client, &container)?;
        }
        Ok(logical)
    }

    /// Register a new replica and fork its process.
    ///
    /// `session` is dedicated to the replica and owned by it from here on:
    /// it is closed when the replica's process exits. Must be called from
    /// within a tokio runtime.
    pub fn start_instance(
        &self,
        logical: &LogicalService,
        session: Arc<dyn CoordinationClient>,
        command: &CommandSpec,
        options: SupervisorOptions,
        join_timeout: Duration,
    ) -> Result<PhysicalServiceInstance> {
        let registration = PhysicalServiceNode {
            name: command.display_name().to_string(),
            host: self.hostname.clone(),
            pid: None,
            service_id: None,
        };
        let node_path = match session.create(
            &join_path(&logical.physical_services_path(), INSTANCE_PREFIX),
            &serde_json::to_vec(&registration)?,
            CreateMode::EphemeralSequential,
        ) {
            Ok(path) => path,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        let mut spec = command
            .clone()
            .env(ENV_INSTANCE_PATH, node_path.clone())
            .env(ENV_LOGICAL_SERVICE, logical.uuid.to_string());
        spec.name = format!("{}/{}", logical.name, node_name(&node_path));

        let supervisor = match ProcessSupervisor::start(&spec, &self.registry, options) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                tracing::error!("Failed to start replica of {}: {}", logical.name, e);
                session.close();
                return Err(e);
            }
        };

        let registration = PhysicalServiceNode {
            pid: supervisor.pid(),
            ..registration
        };
        if let Err(e) = session.set_data(&node_path, &serde_json::to_vec(&registration)?) {
            tracing::warn!("Failed to record pid in {}: {}", node_path, e);
        }

        let (state, _) = watch::channel(InstanceState::Starting);
        let shared = Arc::new(InstanceShared {
            session,
            state,
            contender: OnceLock::new(),
        });

        tokio::spawn(instance_lifecycle(
            shared.clone(),
            logical.clone(),
            node_path.clone(),
            registration,
            supervisor.clone(),
            self.directory.clone(),
            join_timeout,
        ));

        Ok(PhysicalServiceInstance {
            logical: logical.clone(),
            node_path,
            supervisor,
            shared,
        })
    }

    /// Current registrations of `logical`, in sequence order.
    pub fn instances(&self, logical: &LogicalService) -> Result<Vec<(String, PhysicalServiceNode)>> {
        let parent = logical.physical_services_path();
        let client = self.client();
        let mut out = Vec::new();
        for child in client.get_children(&parent)? {
            let path = join_path(&parent, &child);
            if let Some(data) = client.get_data(&path)? {
                out.push((child, serde_json::from_slice(&data)?));
            }
        }
        Ok(out)
    }

    /// Registration node name of the current master, if any.
    pub fn master(&self, logical: &LogicalService) -> Result<Option<String>> {
        let election = logical.election_path();
        let client = self.client();
        let children = client.get_children(&election)?;
        let Some(contender) = elect(&children) else {
            return Ok(None);
        };
        let data = client.get_data(&join_path(&election, contender))?;
        Ok(data.map(|d| String::from_utf8_lossy(&d).into_owned()))
    }

    /// Quorum gate for `logical`, fed from its members node.
    pub fn quorum_gate(&self, logical: &LogicalService) -> Result<(Arc<QuorumGate>, QuorumWatcher)> {
        let gate = Arc::new(QuorumGate::new(logical.replication_factor)?);
        let watcher = match &self.reconnect {
            Some(connect) => {
                QuorumWatcher::reconnecting(connect.clone(), logical.members_path(), gate.clone())
            }
            None => QuorumWatcher::spawn(self.client(), logical.members_path(), gate.clone()),
        };
        Ok((gate, watcher))
    }
}

fn find_logical(
    client: &dyn CoordinationClient,
    name: &str,
    service_path: &str,
) -> Result<Option<LogicalService>> {
    let children = client.get_children(service_path)?;
    let lowest = children
        .iter()
        .filter(|c| c.starts_with(LOGICAL_PREFIX))
        .filter_map(|c| sequence_of(c).map(|seq| (seq, c)))
        .min_by_key(|(seq, _)| *seq);

    let Some((_, child)) = lowest else {
        return Ok(None);
    };
    let path = join_path(service_path, child);
    let Some(data) = client.get_data(&path)? else {
        return Ok(None);
    };
    let node: LogicalServiceNode = serde_json::from_slice(&data)?;
    Ok(Some(LogicalService {
        name: name.to_string(),
        path,
        uuid: node.uuid,
        replication_factor: node.replication_factor,
    }))
}

async fn instance_lifecycle(
    shared: Arc<InstanceShared>,
    logical: LogicalService,
    node_path: String,
    registration: PhysicalServiceNode,
    supervisor: ProcessSupervisor,
    directory: Arc<dyn ServiceDirectory>,
    join_timeout: Duration,
) {
    let instance = node_name(&node_path).to_string();

    // Starting -> Running, unless the process dies first
    let template = ServiceTemplate::by_attribute(INSTANCE_ATTRIBUTE, node_path.clone());
    let mut interrupt = supervisor.interrupt_when_dead(join_timeout);
    let joined = interrupt
        .guard(await_match(&*directory, &template, join_timeout))
        .await;
    interrupt.cancel();

    let item = match joined {
        Ok(Ok(item)) => Some(item),
        Ok(Err(e)) => {
            tracing::warn!("{} of {} did not join: {}", instance, logical.name, e);
            if let Err(e) = supervisor.kill(true).await {
                tracing::error!("Failed to kill {}: {}", instance, e);
            }
            None
        }
        Err(e) => {
            tracing::warn!("{} of {} died before joining: {}", instance, logical.name, e);
            None
        }
    };

    if let Some(item) = item {
        match bind_instance(&shared, &logical, &node_path, registration, &item) {
            Ok(()) => {
                tracing::info!(
                    "{} of {} is running as {}",
                    instance,
                    logical.name,
                    item.service_id
                );
                shared.state.send_replace(InstanceState::Running {
                    service_id: item.service_id,
                });
                tokio::select! {
                    code = supervisor.exit_value() => {
                        tracing::warn!(
                            "{} of {} exited ({})",
                            instance,
                            logical.name,
                            code.map(|c| c.to_string()).unwrap_or_else(|e| e.to_string())
                        );
                    }
                    _ = registration_vanished(&*shared.session, &node_path) => {
                        tracing::warn!(
                            "Registration of {} vanished, stopping its process",
                            instance
                        );
                        if let Err(e) = supervisor.kill(false).await {
                            tracing::error!("Failed to kill {}: {}", instance, e);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to bind {} to {}: {}", instance, item.service_id, e);
                if let Err(e) = supervisor.kill(true).await {
                    tracing::error!("Failed to kill {}: {}", instance, e);
                }
            }
        }
    }

    // ephemerals go with the session
    shared.session.close();
    shared.state.send_replace(InstanceState::Gone);
}

fn bind_instance(
    shared: &InstanceShared,
    logical: &LogicalService,
    node_path: &str,
    registration: PhysicalServiceNode,
    item: &ServiceItem,
) -> Result<()> {
    let session = &shared.session;
    let bound = PhysicalServiceNode {
        service_id: Some(item.service_id),
        ..registration
    };
    session.set_data(node_path, &serde_json::to_vec(&bound)?)?;
    session.create(
        &join_path(&logical.members_path(), &item.service_id.to_string()),
        node_name(node_path).as_bytes(),
        CreateMode::Ephemeral,
    )?;
    let contender = Contender::join(
        session.clone(),
        &logical.election_path(),
        node_name(node_path).as_bytes(),
    )?;
    let _ = shared.contender.set(contender);
    Ok(())
}

/// Resolves once `node_path` is deleted or the session can no longer see it.
async fn registration_vanished(session: &dyn CoordinationClient, node_path: &str) {
    loop {
        let changed = match session.watch(node_path, WatchKind::Data) {
            Ok(rx) => rx,
            Err(_) => return,
        };
        match session.exists(node_path) {
            Ok(true) => {}
            _ => return,
        }
        match changed.await {
            Ok(event) if event.kind == EventKind::DataChanged => continue,
            _ => return,
        }
    }
}
