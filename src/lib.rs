//! # hafleet
//!
//! Supervision and coordination for a fleet of replicated services:
//! - Process supervision with merged output capture and exit-code delivery
//! - Logical services backed by ephemeral registrations in a coordination store
//! - Master election by lowest live sequence number
//! - Quorum tokens gating writes
//! - Best-effort bootstrap of the discovery registrar
//! - A commit-time ordered snapshot catalog for restore-point selection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               Coordination store                     │
//! │  <root>/services/<name>/logicalService<seq>          │
//! │     physicalServices/instance<seq>   (ephemeral)     │
//! │     members/<uuid>                   (ephemeral)     │
//! │     masterElection/contender<seq>    (ephemeral)     │
//! └───────────┬──────────────────────────────────────────┘
//!             │ sessions + watches
//!   ┌─────────┴──────────┬──────────────────┐
//!   │                    │                  │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───────▼──────┐
//! │ Replica A   │   │ Replica B  │   │ Replica C    │
//! │ supervisor  │   │ supervisor │   │ supervisor   │
//! │ + contender │   │ + contender│   │ + contender  │
//! └─────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run an agent
//! ```bash
//! hafleet-agent run --config ./fleet.toml
//! ```
//!
//! ### Inspect snapshots
//! ```bash
//! hafleet-agent snapshots list --dir ./snapshots
//! hafleet-agent snapshots restore-point --dir ./snapshots --at 1700000000000
//! hafleet-agent snapshots prune --dir ./snapshots --keep-last 2 --max-age 7d
//! ```

pub mod common;
pub mod coordination;
pub mod coordinator;
pub mod process;
pub mod snapshot;

// Re-export commonly used types
pub use common::{Error, FleetConfig, Result};
pub use coordinator::{Fleet, LogicalServiceCoordinator, QuorumGate};
pub use process::{ProcessSupervisor, ServiceRegistry};
pub use snapshot::SnapshotCatalog;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
