//! Common utilities and types shared across hafleet

pub mod config;
pub mod error;
pub mod utils;

pub use config::{
    CoordinationConfig, DiscoveryConfig, FleetConfig, JoinMode, ServiceConfig, SnapshotConfig,
    SupervisorConfig,
};
pub use error::{Error, Result};
pub use utils::{crc32, format_bytes, local_hostname, parse_duration, timestamp_now_millis};
