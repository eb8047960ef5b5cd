//! Fleet wiring
//!
//! Builds a running fleet from a [`FleetConfig`]: bootstraps the discovery
//! registrar, locates every configured logical service, starts its replicas
//! and keeps the replica count at the replication factor.

use crate::common::{FleetConfig, JoinMode, Result, ServiceConfig, SupervisorConfig};
use crate::coordination::{
    InMemoryDiscovery, MemoryEnsemble, RegistrarProbe, ServiceItem, SessionId, UnicastProbe,
    INSTANCE_ATTRIBUTE,
};
use crate::coordinator::bootstrap::{
    BootstrapOutcome, CoreServicesBootstrap, DiscoveryConstraints, HostIdentity,
};
use crate::coordinator::quorum::{QuorumGate, QuorumWatcher};
use crate::coordinator::service::{LogicalService, LogicalServiceCoordinator, PhysicalServiceInstance};
use crate::process::{ProcessSupervisor, ServiceRegistry, SupervisorOptions};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often gone replicas are replaced
const REPLENISH_INTERVAL: Duration = Duration::from_secs(1);

struct Replica {
    instance: Arc<PhysicalServiceInstance>,
    /// Discovery entry announced on the replica's behalf
    announced: Option<Uuid>,
}

/// Everything needed to start one more replica of a service
struct ReplicaFactory {
    coordinator: Arc<LogicalServiceCoordinator>,
    ensemble: MemoryEnsemble,
    discovery: InMemoryDiscovery,
    logical: LogicalService,
    service: ServiceConfig,
    supervisor: SupervisorConfig,
}

impl ReplicaFactory {
    fn start(&self) -> Result<Replica> {
        let options = SupervisorOptions::from_config(&self.supervisor, &self.service.name);
        let instance = self.coordinator.start_instance(
            &self.logical,
            Arc::new(self.ensemble.connect()),
            &self.service.command,
            options,
            self.service.join_timeout(),
        )?;

        let announced = match self.service.join {
            JoinMode::OnSpawn => {
                let item = ServiceItem::new(&self.service.name)
                    .with_attribute(INSTANCE_ATTRIBUTE, instance.node_path());
                let id = item.service_id;
                self.discovery.register(item);
                Some(id)
            }
            JoinMode::External => None,
        };
        Ok(Replica {
            instance: Arc::new(instance),
            announced,
        })
    }

    fn retire(&self, replica: &Replica) {
        if let Some(id) = &replica.announced {
            self.discovery.unregister(id);
        }
    }
}

/// One configured logical service and its replicas
pub struct ServiceHandle {
    logical: LogicalService,
    gate: Arc<QuorumGate>,
    watcher: QuorumWatcher,
    replicas: Arc<Mutex<Vec<Replica>>>,
    replenish: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn logical(&self) -> &LogicalService {
        &self.logical
    }

    pub fn gate(&self) -> &Arc<QuorumGate> {
        &self.gate
    }

    /// Coordination session currently feeding the quorum gate
    pub fn watcher_session(&self) -> Option<SessionId> {
        self.watcher.session_id()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Replica>> {
        self.replicas.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instances(&self) -> Vec<Arc<PhysicalServiceInstance>> {
        self.lock().iter().map(|r| r.instance.clone()).collect()
    }

    /// Replica currently believing it is master
    pub fn master(&self) -> Option<Arc<PhysicalServiceInstance>> {
        self.lock()
            .iter()
            .find(|r| r.instance.is_master())
            .map(|r| r.instance.clone())
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("logical", &self.logical)
            .field("gate", &self.gate)
            .field("replicas", &self.lock().len())
            .finish()
    }
}

pub struct Fleet {
    ensemble: MemoryEnsemble,
    discovery: InMemoryDiscovery,
    registry: ServiceRegistry,
    coordinator: Arc<LogicalServiceCoordinator>,
    registrar: Option<ProcessSupervisor>,
    services: Vec<ServiceHandle>,
}

impl Fleet {
    /// Bootstrap discovery, then start every configured service.
    pub async fn start(config: &FleetConfig) -> Result<Self> {
        config.validate()?;
        let ensemble = MemoryEnsemble::new();
        let discovery = InMemoryDiscovery::new();
        let registry = ServiceRegistry::new();

        let registrar = bootstrap_registrar(config, &discovery, &registry).await;

        let coordinator = Arc::new(
            LogicalServiceCoordinator::new(
                Arc::new(ensemble.connect()),
                Arc::new(discovery.clone()),
                registry.clone(),
                config.coordination.root.clone(),
                config.hostname.clone(),
            )
            .with_session_factory(ensemble.session_factory()),
        );

        let mut services = Vec::with_capacity(config.services.len());
        for service in &config.services {
            let logical =
                coordinator.locate_or_create(&service.name, service.replication_factor)?;
            let (gate, watcher) = coordinator.quorum_gate(&logical)?;
            let factory = Arc::new(ReplicaFactory {
                coordinator: coordinator.clone(),
                ensemble: ensemble.clone(),
                discovery: discovery.clone(),
                logical: logical.clone(),
                service: service.clone(),
                supervisor: config.supervisor.clone(),
            });

            let mut replicas = Vec::with_capacity(logical.replication_factor);
            for _ in 0..logical.replication_factor {
                match factory.start() {
                    Ok(replica) => replicas.push(replica),
                    Err(e) => tracing::error!("Failed to start {} replica: {}", service.name, e),
                }
            }
            tracing::info!(
                "Started {}/{} replicas of {} ({})",
                replicas.len(),
                logical.replication_factor,
                service.name,
                logical.uuid
            );

            let replicas = Arc::new(Mutex::new(replicas));
            let replenish = tokio::spawn(replenish(factory, replicas.clone()));
            services.push(ServiceHandle {
                logical,
                gate,
                watcher,
                replicas,
                replenish,
            });
        }

        Ok(Self {
            ensemble,
            discovery,
            registry,
            coordinator,
            registrar,
            services,
        })
    }

    pub fn services(&self) -> &[ServiceHandle] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceHandle> {
        self.services.iter().find(|s| s.logical.name == name)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    pub fn discovery(&self) -> &InMemoryDiscovery {
        &self.discovery
    }

    pub fn coordinator(&self) -> &LogicalServiceCoordinator {
        &self.coordinator
    }

    pub fn registrar(&self) -> Option<&ProcessSupervisor> {
        self.registrar.as_ref()
    }

    /// Wait for every service to reach quorum; returns `(name, token)` pairs.
    pub async fn await_quorum(&self, timeout: Duration) -> Result<Vec<(String, u64)>> {
        let mut tokens = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let token = service.gate.await_quorum(timeout).await?;
            tokens.push((service.logical.name.clone(), token));
        }
        Ok(tokens)
    }

    /// Stop replenishing and kill every supervised process.
    pub async fn shutdown(self, immediate: bool) {
        for service in &self.services {
            service.replenish.abort();
        }
        for (name, result) in self.registry.kill_all(immediate).await {
            match result {
                Ok(code) => tracing::info!("{} stopped ({})", name, code),
                Err(e) => tracing::warn!("Failed to stop {}: {}", name, e),
            }
        }
        tracing::info!(
            "Fleet stopped, {} live coordination session(s)",
            self.ensemble.live_sessions()
        );
    }
}

/// Run discovery bootstrap. Without a registrar command the in-process
/// directory serves as this host's registrar.
async fn bootstrap_registrar(
    config: &FleetConfig,
    discovery: &InMemoryDiscovery,
    registry: &ServiceRegistry,
) -> Option<ProcessSupervisor> {
    let constraints = DiscoveryConstraints::from_config(&config.discovery);
    let Some(command) = &config.discovery.command else {
        tracing::info!("No registrar command configured, using in-process discovery");
        discovery.register_registrar(config.hostname.clone());
        return None;
    };

    let probe: Arc<dyn RegistrarProbe> = if constraints.is_unicast() {
        Arc::new(UnicastProbe::new(constraints.locators.clone()))
    } else {
        Arc::new(discovery.clone())
    };
    let hostname = config.hostname.clone();
    let host = match tokio::task::spawn_blocking(move || HostIdentity::resolve(hostname)).await {
        Ok(host) => host,
        Err(e) => {
            tracing::warn!("Resolving {} failed: {}", config.hostname, e);
            HostIdentity::new(config.hostname.clone(), Vec::new())
        }
    };
    let bootstrap = CoreServicesBootstrap::new(
        host,
        probe,
        registry.clone(),
        command.clone(),
    )
    .with_options(SupervisorOptions::from_config(
        &config.supervisor,
        command.display_name(),
    ))
    .with_probe_timeout(config.probe_timeout());

    match bootstrap
        .maybe_start_discovery(&constraints, config.discovery.desired_registrars)
        .await
    {
        BootstrapOutcome::Started(supervisor) => {
            discovery.register_registrar(config.hostname.clone());
            Some(supervisor)
        }
        BootstrapOutcome::NotStarted(reason) => {
            tracing::info!("Discovery not started here: {}", reason);
            None
        }
    }
}

async fn replenish(factory: Arc<ReplicaFactory>, replicas: Arc<Mutex<Vec<Replica>>>) {
    let mut interval = tokio::time::interval(REPLENISH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut replicas = replicas.lock().unwrap_or_else(|e| e.into_inner());
        let before = replicas.len();
        replicas.retain(|replica| {
            if replica.instance.is_gone() {
                factory.retire(replica);
                false
            } else {
                true
            }
        });
        let missing = factory.logical.replication_factor.saturating_sub(replicas.len());
        if missing == 0 {
            continue;
        }
        tracing::info!(
            "{} has {} of {} replicas ({} gone), starting {}",
            factory.logical.name,
            replicas.len(),
            factory.logical.replication_factor,
            before - replicas.len(),
            missing
        );
        for _ in 0..missing {
            match factory.start() {
                Ok(replica) => replicas.push(replica),
                Err(e) => {
                    tracing::error!("Failed to restart {} replica: {}", factory.logical.name, e);
                    break;
                }
            }
        }
    }
}
