//! Replicated service coordination
//!
//! The coordinator is responsible for:
//! - Logical service identity and replica registration
//! - Master election among joined replicas
//! - Quorum tokens for write gating
//! - Bootstrapping the discovery registrar
//! - Keeping each service at its replication factor

pub mod bootstrap;
pub mod election;
pub mod fleet;
pub mod quorum;
pub mod service;

pub use bootstrap::{
    BootstrapOutcome, CoreServicesBootstrap, DiscoveryConstraints, HostIdentity, NotStarted,
};
pub use election::{elect, Contender, Leadership};
pub use fleet::{Fleet, ServiceHandle};
pub use quorum::{QuorumGate, QuorumState, QuorumWatcher, NO_QUORUM};
pub use service::{
    InstanceState, LogicalService, LogicalServiceCoordinator, LogicalServiceNode,
    PhysicalServiceInstance, PhysicalServiceNode,
};
