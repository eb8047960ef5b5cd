//! Child process supervision
//!
//! - `command`: what to launch
//! - `supervisor`: one monitored child process
//! - `registry`: the set of live supervisors

pub mod command;
pub mod registry;
pub mod supervisor;

pub use command::CommandSpec;
pub use registry::ServiceRegistry;
pub use supervisor::{DeathInterrupt, ProcessSupervisor, SupervisorOptions, FOREVER};
